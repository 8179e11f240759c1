//! Run configuration and the command line that fills it in.
//!
//! Every flag is optional and mirrored by a `SOAK_*` environment variable,
//! so the binary runs with no arguments using the `light` profile.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use crate::facade::Extractor;
use crate::faults::FaultProfile;

/// How a verified entry is drained from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RemovalMode {
    /// Conditional remove-always over the lookup filter.
    Filter,
    /// Remove by primary key.
    Key,
}

/// Whether a removal that missed its entry turns a verified lookup into a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SuccessCriteria {
    /// Removal mismatches are counted but the lookup still succeeds.
    Lenient,
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    /// 1500 records per fill, 5 workers, filter removal, lenient success.
    Light,
    /// 10000 records per fill, 8 workers, per-key removal, strict success.
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyConfig {
    pub extractor: Extractor,
    pub remove_matched: bool,
    pub removal: RemovalMode,
    pub success: SuccessCriteria,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            extractor: Extractor::Key,
            remove_matched: true,
            removal: RemovalMode::Filter,
            success: SuccessCriteria::Lenient,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SoakConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub report_window: Duration,
    /// `None` runs until cancelled.
    pub max_iterations: Option<u64>,
    pub cycle_pause: Duration,
    pub shutdown_grace: Duration,
    pub clear_each_cycle: bool,
    pub check_fill_size: bool,
    pub verify: VerifyConfig,
}

impl SoakConfig {
    pub fn profile(profile: Profile) -> Self {
        let base = Self {
            batch_size: 1500,
            workers: 5,
            report_window: Duration::from_secs(5),
            max_iterations: Some(50),
            cycle_pause: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(30),
            clear_each_cycle: false,
            check_fill_size: true,
            verify: VerifyConfig::default(),
        };
        match profile {
            Profile::Light => base,
            Profile::Heavy => Self {
                batch_size: 10_000,
                workers: 8,
                verify: VerifyConfig {
                    removal: RemovalMode::Key,
                    success: SuccessCriteria::Strict,
                    ..base.verify
                },
                ..base
            },
        }
    }
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self::profile(Profile::Light)
    }
}

#[derive(Parser, Debug)]
#[command(name = "cachesoak")]
#[command(about = "Soak a cache with fill/verify cycles through an index lookup")]
pub struct Args {
    /// Base settings; individual flags override them
    #[arg(long, env = "SOAK_PROFILE", value_enum, default_value = "light")]
    pub profile: Profile,

    /// Records generated per fill
    #[arg(long, env = "SOAK_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Verification worker count
    #[arg(long, env = "SOAK_WORKERS")]
    pub workers: Option<usize>,

    /// Statistics window in milliseconds
    #[arg(long, env = "SOAK_REPORT_WINDOW_MS")]
    pub report_window_ms: Option<u64>,

    /// Stop after this many reports; 0 runs until interrupted
    #[arg(long, env = "SOAK_MAX_ITERATIONS")]
    pub max_iterations: Option<u64>,

    /// Pause between cycles in milliseconds
    #[arg(long, env = "SOAK_CYCLE_PAUSE_MS")]
    pub cycle_pause_ms: Option<u64>,

    /// Seconds to wait for workers on shutdown
    #[arg(long, env = "SOAK_SHUTDOWN_GRACE_SECS")]
    pub shutdown_grace_secs: Option<u64>,

    /// Attribute the lookup index is built over
    #[arg(long, env = "SOAK_EXTRACTOR", value_enum)]
    pub extractor: Option<Extractor>,

    #[arg(long, env = "SOAK_REMOVAL", value_enum)]
    pub removal: Option<RemovalMode>,

    #[arg(long, env = "SOAK_SUCCESS", value_enum)]
    pub success: Option<SuccessCriteria>,

    /// Leave verified entries in the cache
    #[arg(long, env = "SOAK_KEEP_ENTRIES")]
    pub keep_entries: bool,

    /// Clear the cache before every fill
    #[arg(long, env = "SOAK_CLEAR_EACH_CYCLE")]
    pub clear_each_cycle: bool,

    #[arg(long, env = "SOAK_SKIP_SIZE_CHECK")]
    pub skip_size_check: bool,

    /// Shards of the in-process cache
    #[arg(long, env = "SOAK_SHARDS", default_value = "16")]
    pub shards: usize,

    /// Probability a lookup comes back empty
    #[arg(long, env = "SOAK_DROP_RATE", default_value = "0")]
    pub drop_rate: f64,

    /// Probability a lookup returns a duplicate hit
    #[arg(long, env = "SOAK_DUPLICATE_RATE", default_value = "0")]
    pub duplicate_rate: f64,

    /// Probability a lookup fails outright
    #[arg(long, env = "SOAK_ERROR_RATE", default_value = "0")]
    pub error_rate: f64,

    /// Fault injection seed
    #[arg(long, env = "SOAK_SEED", default_value = "42")]
    pub seed: u64,
}

impl Args {
    pub fn soak_config(&self) -> SoakConfig {
        let mut cfg = SoakConfig::profile(self.profile);
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.workers {
            cfg.workers = v.max(1);
        }
        if let Some(ms) = self.report_window_ms {
            cfg.report_window = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_iterations {
            cfg.max_iterations = if n == 0 { None } else { Some(n) };
        }
        if let Some(ms) = self.cycle_pause_ms {
            cfg.cycle_pause = Duration::from_millis(ms);
        }
        if let Some(s) = self.shutdown_grace_secs {
            cfg.shutdown_grace = Duration::from_secs(s);
        }
        if let Some(e) = self.extractor {
            cfg.verify.extractor = e;
        }
        if let Some(r) = self.removal {
            cfg.verify.removal = r;
        }
        if let Some(s) = self.success {
            cfg.verify.success = s;
        }
        cfg.verify.remove_matched = !self.keep_entries;
        cfg.clear_each_cycle = self.clear_each_cycle;
        cfg.check_fill_size = !self.skip_size_check;
        cfg
    }

    pub fn fault_profile(&self) -> FaultProfile {
        FaultProfile {
            drop_rate: self.drop_rate.clamp(0.0, 1.0),
            duplicate_rate: self.duplicate_rate.clamp(0.0, 1.0),
            error_rate: self.error_rate.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_gives_light_profile() {
        let args = Args::try_parse_from(["cachesoak"]).unwrap();
        let cfg = args.soak_config();
        assert_eq!(cfg.batch_size, 1500);
        assert_eq!(cfg.workers, 5);
        assert_eq!(cfg.max_iterations, Some(50));
        assert_eq!(cfg.verify.success, SuccessCriteria::Lenient);
        assert!(args.fault_profile().is_quiet());
    }

    #[test]
    fn flags_override_profile() {
        let args = Args::try_parse_from([
            "cachesoak",
            "--profile",
            "heavy",
            "--workers",
            "0",
            "--max-iterations",
            "0",
            "--success",
            "lenient",
            "--keep-entries",
        ])
        .unwrap();
        let cfg = args.soak_config();
        assert_eq!(cfg.batch_size, 10_000);
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.max_iterations, None);
        assert_eq!(cfg.verify.removal, RemovalMode::Key);
        assert_eq!(cfg.verify.success, SuccessCriteria::Lenient);
        assert!(!cfg.verify.remove_matched);
    }
}
