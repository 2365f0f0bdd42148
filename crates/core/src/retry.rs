//! Exponential backoff with a ceiling and symmetric jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy applied by the dispatcher after a retryable execution failure.
///
/// `attempt` is the number of failures already recorded on the job, so the
/// first retry uses `next_delay(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional jitter; `0.2` spreads each delay over ±20% of its ceiling
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// `min(max_delay, base_delay * 2^attempt)` without jitter.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Jittered delay before the next attempt.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with_jitter(attempt, sample)
    }

    /// Delay for a given jitter sample in `[-1, 1]`; never exceeds `max_delay`.
    pub fn delay_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        let scale = 1.0 + self.jitter * sample.clamp(-1.0, 1.0);
        ceiling.mul_f64(scale.max(0.0)).min(self.max_delay)
    }
}
