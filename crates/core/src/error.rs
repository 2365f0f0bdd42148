//! Error taxonomy shared by the queue, the store backends and the dispatcher.

use std::time::Duration;

use thiserror::Error;

use crate::id::JobId;

/// Result type used by queue and store operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Failure of a queue/store operation.
///
/// `QueueFull` is a normal back-pressure signal for producers, not a fault.
/// `StoreUnavailable` is fatal at startup and retried with backoff at runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Enqueue rejected: resident jobs already at `max_queue_size`.
    #[error("queue full: {capacity} jobs resident")]
    QueueFull { capacity: usize },

    /// No resident or dead-lettered job with this id.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The caller's lease was reclaimed (visibility timeout) or never existed.
    #[error("lease on job {0} is no longer held by this worker")]
    LeaseMismatch(JobId),

    /// The job exists but is not in a state that permits the operation.
    #[error("job {job_id} is {status}: {reason}")]
    InvalidState {
        job_id: JobId,
        status: String,
        reason: &'static str,
    },

    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, QueueError::StoreUnavailable(_))
    }
}

/// Failure reported by (or imposed on) a job executor call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Network/provider hiccup; retried and counted against breaker health.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed payload or similar; never retried, not a provider health signal.
    #[error("terminal failure: {0}")]
    Terminal(String),

    /// The per-call deadline expired.
    #[error("call exceeded its {0:?} deadline")]
    TimedOut(Duration),
}

impl ExecutionError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::Terminal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_retryable() {
        assert!(ExecutionError::TimedOut(Duration::from_secs(1)).is_retryable());
        assert!(ExecutionError::transient("502").is_retryable());
        assert!(!ExecutionError::terminal("bad payload").is_retryable());
    }
}
