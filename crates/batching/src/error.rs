use thiserror::Error;

/// Failure outcome delivered to a caller waiting on a batch.
///
/// `Clone` because one backend failure is reported to every waiter of the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("bulk call failed: {0}")]
    Backend(String),

    #[error("bulk call returned {got} outputs for {expected} inputs")]
    CardinalityMismatch { expected: usize, got: usize },

    #[error("batch did not complete within {0} ms")]
    Timeout(u64),

    #[error("no output recorded for token")]
    MissingOutput,

    #[error("request could not be admitted into a batch")]
    AdmissionFailed,
}
