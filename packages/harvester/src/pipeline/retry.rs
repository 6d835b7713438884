//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::error::FetchError;

/// Retry schedule for transient upstream failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per request, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Retry without waiting (for tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another.
    pub fn should_retry(&self, attempt: u32, error: &FetchError) -> bool {
        error.is_transient() && attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt`. `Retry-After` acts as a floor.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);

        let delay = if self.jitter > 0.0 && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
            delay.mul_f64(1.0 + extra)
        } else {
            delay
        };

        match retry_after {
            Some(floor) => delay.max(floor),
            None => delay,
        }
    }
}
