//! Soak harness for key-value caches.
//!
//! Repeatedly bulk-loads generated records, looks every one of them up
//! through a secondary index from a bounded worker pool, counts lookups
//! that did not return exactly one entry, drains verified entries, and
//! reports running success rates.

pub mod config;
pub mod error;
pub mod facade;
pub mod faults;
pub mod fill;
pub mod memory;
pub mod orchestrator;
pub mod pool;
pub mod record;

pub use config::{Args, Profile, RemovalMode, SoakConfig, SuccessCriteria, VerifyConfig};
pub use error::{SoakError, SoakResult};
pub use facade::{CacheFacade, Extractor, Filter};
pub use faults::{FaultProfile, FaultyCache};
pub use fill::{fill, FillReport};
pub use memory::ShardedCache;
pub use orchestrator::{stop_channel, Counters, Orchestrator, RunReport, StopReason, WindowReport};
pub use pool::{verify_key, ShutdownStatus, VerifyOutcome, VerifyPool, VerifySummary};
pub use record::{generate, Batch, Record, Sequence};
