//! Per-run state shared by every component of a harvest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Explicit run state: who we are, whether to stop, and what happened so far.
#[derive(Clone)]
pub struct RunContext {
    worker_id: Arc<str>,
    cancel: CancellationToken,
    counters: Arc<RunCounters>,
}

#[derive(Default)]
struct RunCounters {
    requests: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
    pages_fetched: AtomicU64,
    pages_failed: AtomicU64,
}

/// Point-in-time copy of the run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub requests: u64,
    pub retries: u64,
    pub rate_limited: u64,
    pub pages_fetched: u64,
    pub pages_failed: u64,
}

impl RunContext {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self::with_token(worker_id, CancellationToken::new())
    }

    /// Share an existing token, e.g. one cancelled by a signal handler.
    pub fn with_token(worker_id: impl Into<String>, cancel: CancellationToken) -> Self {
        let worker_id: String = worker_id.into();
        Self {
            worker_id: worker_id.into(),
            cancel,
            counters: Arc::new(RunCounters::default()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn record_request(&self) {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page(&self) {
        self.counters.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_failure(&self) {
        self.counters.pages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let c = &self.counters;
        CounterSnapshot {
            requests: c.requests.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            pages_fetched: c.pages_fetched.load(Ordering::Relaxed),
            pages_failed: c.pages_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters_and_token() {
        let ctx = RunContext::new("w1");
        let clone = ctx.clone();
        clone.record_request();
        clone.record_retry();
        clone.cancel();

        assert_eq!(ctx.snapshot().requests, 1);
        assert_eq!(ctx.snapshot().retries, 1);
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.worker_id(), "w1");
    }
}
