//! Adaptive global concurrency limit for upstream requests.
//!
//! A semaphore caps in-flight requests across every task. A 429 takes one
//! permit out of circulation (never going below one); a run of successes
//! puts one back, up to the configured maximum. Optional pacing in
//! requests/second uses governor on top of the semaphore.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use governor::{Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{FetchError, FetchResult};
use crate::types::config::HarvestConfig;

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Successes needed before one permit is restored.
const DEFAULT_RECOVER_AFTER: u32 = 20;

#[derive(Clone)]
pub struct AdaptiveLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    semaphore: Arc<Semaphore>,
    max: usize,
    recover_after: u32,
    state: Mutex<LimiterState>,
    pacer: Option<DirectRateLimiter>,
}

struct LimiterState {
    current: usize,
    successes: u32,
    /// Permits to retire as soon as their holders return them.
    debt: usize,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A held request slot. Returning it may retire it if the limit shrank meanwhile.
pub struct LimiterPermit {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<Inner>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            let mut state = self.inner.state();
            if state.debt > 0 {
                state.debt -= 1;
                permit.forget();
            }
        }
    }
}

impl AdaptiveLimiter {
    pub fn new(max_concurrency: usize) -> Self {
        Self::with_settings(max_concurrency, DEFAULT_RECOVER_AFTER, None)
    }

    /// `recover_after` successes restore one permit; `requests_per_second` of
    /// `None` or zero disables pacing.
    pub fn with_settings(
        max_concurrency: usize,
        recover_after: u32,
        requests_per_second: Option<u32>,
    ) -> Self {
        let max = max_concurrency.max(1);
        let pacer = requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(max)),
                max,
                recover_after: recover_after.max(1),
                state: Mutex::new(LimiterState {
                    current: max,
                    successes: 0,
                    debt: 0,
                }),
                pacer,
            }),
        }
    }

    pub fn from_config(config: &HarvestConfig) -> Self {
        Self::with_settings(
            config.max_concurrency,
            DEFAULT_RECOVER_AFTER,
            config.requests_per_second,
        )
    }

    /// Wait for pacing and a free slot.
    pub async fn acquire(&self) -> FetchResult<LimiterPermit> {
        if let Some(pacer) = &self.inner.pacer {
            pacer.until_ready().await;
        }
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Transport("concurrency limiter closed".into()))?;
        Ok(LimiterPermit {
            permit: Some(permit),
            inner: self.inner.clone(),
        })
    }

    /// Current effective concurrency.
    pub fn current(&self) -> usize {
        self.inner.state().current
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    pub fn on_success(&self) {
        let mut state = self.inner.state();
        if state.current >= self.inner.max {
            return;
        }
        state.successes += 1;
        if state.successes < self.inner.recover_after {
            return;
        }
        state.successes = 0;
        state.current += 1;
        if state.debt > 0 {
            state.debt -= 1;
        } else {
            self.inner.semaphore.add_permits(1);
        }
        debug!(concurrency = state.current, "Concurrency recovered");
    }

    pub fn on_rate_limited(&self) {
        let mut state = self.inner.state();
        state.successes = 0;
        if state.current <= 1 {
            return;
        }
        state.current -= 1;
        match self.inner.semaphore.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(_) => state.debt += 1,
        }
        warn!(concurrency = state.current, "Rate limited, reducing concurrency");
    }
}
