//! Typed errors for the harvester library.
//!
//! Uses `thiserror` for library errors (the binary wraps them in `anyhow`).

use std::time::Duration;

use thiserror::Error;

use crate::types::task::TaskStatus;

/// Errors that abort a harvest operation.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// A status change not present in the transition table.
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// The task changed under us (another worker won the race).
    #[error("claim conflict on task {task_id}: expected status {expected}")]
    ClaimConflict {
        task_id: String,
        expected: TaskStatus,
    },

    /// The worker no longer holds the task's lease (it expired and was reaped).
    #[error("lease lost on task {task_id} by worker {worker_id}")]
    LeaseLost { task_id: String, worker_id: String },

    /// Task does not exist
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Planning failed
    #[error("planning error: {0}")]
    Planning(#[from] PlanningError),

    /// Persisted work was planned under a different configuration.
    #[error("plan fingerprint mismatch: persisted {persisted}, current {current}")]
    FingerprintMismatch { persisted: String, current: String },

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// The completion ledger could not be read
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The writer task is gone
    #[error("content writer closed")]
    WriterClosed,

    /// The writer failed to commit at least one batch since the last flush.
    #[error("content writer failed {failed_batches} batch(es): {last_error}")]
    Persistence {
        failed_batches: usize,
        last_error: String,
    },

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

/// Errors raised while turning a request into a plan.
#[derive(Debug, Error)]
pub enum PlanningError {
    /// Neither bound was resolvable and backfill mode is off.
    #[error("no date range resolvable (start and end required outside backfill mode)")]
    NoDateRange,

    #[error("inverted date range: {start} > {end}")]
    InvertedRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),
}

/// Outcome classes of a single upstream exchange that did not succeed.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Timeout, connection reset, DNS failure...
    #[error("transient network error: {0}")]
    Transport(String),

    /// HTTP 429
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx
    #[error("upstream server error: HTTP {status}")]
    Upstream { status: u16 },

    /// Any other 4xx, or a 5xx whose retries were exhausted.
    #[error("permanent request error: HTTP {status}")]
    Permanent { status: u16 },

    /// Body was not the expected JSON envelope
    #[error("malformed response body: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Transport(_) | FetchError::RateLimited { .. } | FetchError::Upstream { .. }
        )
    }

    /// HTTP status carried by this error, if the exchange got that far.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            FetchError::RateLimited { .. } => Some(429),
            FetchError::Upstream { status } | FetchError::Permanent { status } => Some(*status),
            FetchError::Transport(_) | FetchError::Decode(_) => None,
        }
    }

    /// Escalate an exhausted transient error to a permanent one.
    pub fn escalate(self) -> FetchError {
        match self {
            FetchError::Upstream { status } => FetchError::Permanent { status },
            other => other,
        }
    }
}

/// Result type alias for harvester operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for a single upstream exchange.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Transport("reset".into()).is_transient());
        assert!(FetchError::RateLimited { retry_after: None }.is_transient());
        assert!(FetchError::Upstream { status: 503 }.is_transient());
        assert!(!FetchError::Permanent { status: 400 }.is_transient());
        assert!(!FetchError::Decode("eof".into()).is_transient());
    }

    #[test]
    fn test_escalation_turns_5xx_permanent() {
        let escalated = FetchError::Upstream { status: 502 }.escalate();
        assert!(matches!(escalated, FetchError::Permanent { status: 502 }));
        assert!(!escalated.is_transient());
    }
}
