//! Request and token budget per one-minute window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use admitq_core::clock::{self, Clock};
use admitq_core::{QueueResult, RateLimitConfig};

use crate::store::{AdmissionStore, InMemoryAdmissionStore};

pub const WINDOW: Duration = Duration::from_secs(60);

/// Fixed one-minute window, reset lazily on the next acquire after it elapses.
///
/// Acquires that would exceed either ceiling are refused, never clamped, so
/// the counts never exceed the configured limits. The window itself lives in
/// an [`AdmissionStore`], so every process sharing that store shares one budget.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn AdmissionStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub started_at: DateTime<Utc>,
    pub requests: u32,
    pub tokens: u64,
}

/// Reply of [`AdmissionStore::acquire`]: the verdict and the window it was judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquire {
    pub granted: bool,
    pub window: Window,
}

impl Window {
    pub fn starting(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            requests: 0,
            tokens: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        clock::elapsed(self.started_at, now) >= WINDOW
    }

    /// The live window in `slot`, opening a fresh one if none exists or the last has elapsed.
    pub(crate) fn current(slot: &mut Option<Window>, now: DateTime<Utc>) -> &mut Window {
        if slot.is_some_and(|w| w.is_expired(now)) {
            *slot = None;
        }
        slot.get_or_insert_with(|| Window::starting(now))
    }

    /// Charge one request and `tokens` unless a ceiling would be exceeded.
    pub(crate) fn try_charge(&mut self, limits: RateLimitConfig, tokens: u64) -> bool {
        let requests = self.requests.saturating_add(1);
        let total = self.tokens.saturating_add(tokens);
        if requests > limits.requests_per_minute || total > limits.tokens_per_minute {
            return false;
        }
        self.requests = requests;
        self.tokens = total;
        true
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>, store: Arc<dyn AdmissionStore>) -> Self {
        Self {
            config,
            clock,
            store,
        }
    }

    /// A limiter whose window is private to this process.
    pub fn in_memory(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config, clock, InMemoryAdmissionStore::arc())
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Whether a job with this estimate could ever be granted.
    pub fn admits(&self, estimated_tokens: u64) -> bool {
        estimated_tokens <= self.config.tokens_per_minute
    }

    pub async fn try_acquire(&self, estimated_tokens: u64) -> QueueResult<bool> {
        let Acquire { granted, window } = self
            .store
            .acquire(self.config, estimated_tokens, self.clock.now())
            .await?;
        if !granted {
            debug!(
                requests = window.requests,
                tokens = window.tokens,
                estimated_tokens,
                "rate limit reached"
            );
        }
        Ok(granted)
    }

    /// Charge tokens used beyond the pre-charged estimate. Under-use is not
    /// refunded. The charge may push the window past its token ceiling, which
    /// only delays later acquires.
    pub async fn record_usage(&self, estimated_tokens: u64, actual_tokens: u64) -> QueueResult<()> {
        let Some(excess) = actual_tokens.checked_sub(estimated_tokens).filter(|e| *e > 0) else {
            return Ok(());
        };
        let window = self.store.charge_tokens(excess, self.clock.now()).await?;
        debug!(excess, tokens = window.tokens, "token usage reconciled");
        Ok(())
    }

    pub async fn snapshot(&self) -> QueueResult<Window> {
        self.store.window(self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use admitq_core::ManualClock;
    use proptest::prelude::*;

    fn limiter(rpm: u32, tpm: u64) -> (Arc<ManualClock>, RateLimiter) {
        let clock = ManualClock::starting_now();
        let limiter = RateLimiter::in_memory(
            RateLimitConfig {
                requests_per_minute: rpm,
                tokens_per_minute: tpm,
            },
            clock.clone(),
        );
        (clock, limiter)
    }

    #[tokio::test]
    async fn third_request_waits_for_rollover() {
        let (clock, limiter) = limiter(2, 1_000);
        assert!(limiter.try_acquire(0).await.unwrap());
        assert!(limiter.try_acquire(0).await.unwrap());
        assert!(!limiter.try_acquire(0).await.unwrap());

        clock.advance(Duration::from_secs(59));
        assert!(!limiter.try_acquire(0).await.unwrap());
        clock.advance(Duration::from_secs(1));
        assert!(limiter.try_acquire(0).await.unwrap());
    }

    #[tokio::test]
    async fn token_ceiling_refuses_instead_of_clamping() {
        let (_, limiter) = limiter(100, 1_000);
        assert!(limiter.try_acquire(600).await.unwrap());
        assert!(!limiter.try_acquire(500).await.unwrap());
        assert!(limiter.try_acquire(400).await.unwrap());
        let window = limiter.snapshot().await.unwrap();
        assert_eq!(window.tokens, 1_000);
        assert_eq!(window.requests, 2);
    }

    #[tokio::test]
    async fn reconciliation_only_charges_excess() {
        let (_, limiter) = limiter(100, 1_000);
        assert!(limiter.try_acquire(300).await.unwrap());
        limiter.record_usage(300, 200).await.unwrap();
        assert_eq!(limiter.snapshot().await.unwrap().tokens, 300);
        limiter.record_usage(300, 800).await.unwrap();
        assert_eq!(limiter.snapshot().await.unwrap().tokens, 800);
        assert!(!limiter.try_acquire(300).await.unwrap());
    }

    #[tokio::test]
    async fn oversized_estimate_is_never_admitted() {
        let (_, limiter) = limiter(10, 75_000);
        assert!(limiter.admits(75_000));
        assert!(!limiter.admits(75_001));
        assert!(!limiter.try_acquire(75_001).await.unwrap());
    }

    #[tokio::test]
    async fn limiters_over_one_store_share_the_budget() {
        let clock = ManualClock::starting_now();
        let store = InMemoryAdmissionStore::arc();
        let config = RateLimitConfig {
            requests_per_minute: 3,
            tokens_per_minute: 10_000,
        };
        let first = RateLimiter::new(config, clock.clone(), store.clone());
        let second = RateLimiter::new(config, clock.clone(), store);

        assert!(first.try_acquire(0).await.unwrap());
        assert!(second.try_acquire(0).await.unwrap());
        assert!(first.try_acquire(0).await.unwrap());
        assert!(!second.try_acquire(0).await.unwrap());
        assert!(!first.try_acquire(0).await.unwrap());
        assert_eq!(second.snapshot().await.unwrap().requests, 3);
    }

    #[test]
    fn elapsed_window_is_replaced() {
        let now = Utc::now();
        let mut slot = Some(Window {
            started_at: now,
            requests: 7,
            tokens: 700,
        });
        assert_eq!(Window::current(&mut slot, now).requests, 7);
        let later = clock::after(now, WINDOW);
        assert_eq!(*Window::current(&mut slot, later), Window::starting(later));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn grants_never_exceed_ceilings_within_a_window(
            rpm in 1u32..20,
            tpm in 1u64..5_000,
            steps in prop::collection::vec((0u64..15_000, 0u64..2_000), 1..200),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (clock, limiter) = limiter(rpm, tpm);
            let mut window_start = rt.block_on(limiter.snapshot()).unwrap().started_at;
            let mut granted_requests = 0u32;
            let mut granted_tokens = 0u64;

            for (advance_ms, tokens) in steps {
                clock.advance(Duration::from_millis(advance_ms));
                let granted = rt.block_on(limiter.try_acquire(tokens)).unwrap();
                let window = rt.block_on(limiter.snapshot()).unwrap();
                if window.started_at != window_start {
                    window_start = window.started_at;
                    granted_requests = 0;
                    granted_tokens = 0;
                }
                if granted {
                    granted_requests += 1;
                    granted_tokens += tokens;
                }
                prop_assert!(granted_requests <= rpm);
                prop_assert!(granted_tokens <= tpm);
                prop_assert_eq!(window.requests, granted_requests);
                prop_assert_eq!(window.tokens, granted_tokens);
            }
        }
    }
}
