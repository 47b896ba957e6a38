//! Worker-level error type.

use thiserror::Error;

/// Errors returned by a worker's `run` method.
///
/// The executor uses the variant to decide retry behaviour:
/// - `Retryable`: the build is attempted again with exponential back-off.
/// - `Fatal`: the target is immediately marked as failed.
#[derive(Debug, Error, Clone)]
pub enum WorkerError {
    /// Transient failure; the executor should re-try the build.
    #[error("retryable worker error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal worker error: {0}")]
    Fatal(String),
}

impl WorkerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
