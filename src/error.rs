use thiserror::Error;

/// Errors that stop a soak run.
///
/// Per-key verification problems are never errors; they are counted as
/// outcomes by the worker pool.
#[derive(Error, Debug)]
pub enum SoakError {
    /// The primary-key sequence reached `u64::MAX`.
    #[error("key sequence exhausted at {last}")]
    SequenceExhausted { last: u64 },

    /// The collaborator could not be prepared (initial clear or index install).
    #[error("startup failed while {stage}: {source}")]
    Startup {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A facade call outside the verification pool failed.
    #[error("cache facade error: {0}")]
    Facade(#[from] anyhow::Error),
}

pub type SoakResult<T> = Result<T, SoakError>;
