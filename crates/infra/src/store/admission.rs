//! Admission state shared by every worker: the rate-limit window and the
//! circuit breaker.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use admitq_core::{CircuitBreakerConfig, QueueResult, RateLimitConfig};

use crate::circuit_breaker::{CircuitEvent, CircuitSnapshot, CircuitTransition};
use crate::rate_limiter::{Acquire, Window};

/// Storage behind [`RateLimiter`](crate::RateLimiter) and
/// [`CircuitBreaker`](crate::CircuitBreaker). Each method is atomic, so
/// processes sharing a backend share one budget and one breaker.
#[async_trait]
pub trait AdmissionStore: Send + Sync + core::fmt::Debug {
    /// Charge one request and `tokens` to the live window unless a ceiling
    /// would be exceeded.
    async fn acquire(
        &self,
        limits: RateLimitConfig,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> QueueResult<Acquire>;

    /// Add `tokens` to the live window with no ceiling check.
    async fn charge_tokens(&self, tokens: u64, now: DateTime<Utc>) -> QueueResult<Window>;

    async fn window(&self, now: DateTime<Utc>) -> QueueResult<Window>;

    async fn circuit_event(
        &self,
        event: CircuitEvent,
        config: CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> QueueResult<CircuitTransition>;

    async fn circuit(&self) -> QueueResult<CircuitSnapshot>;
}

/// Process-local admission state.
#[derive(Debug, Default)]
pub struct InMemoryAdmissionStore {
    window: Mutex<Option<Window>>,
    circuit: Mutex<CircuitSnapshot>,
}

impl InMemoryAdmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl AdmissionStore for InMemoryAdmissionStore {
    async fn acquire(
        &self,
        limits: RateLimitConfig,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> QueueResult<Acquire> {
        let mut slot = self.window.lock();
        let window = Window::current(&mut slot, now);
        let granted = window.try_charge(limits, tokens);
        Ok(Acquire {
            granted,
            window: *window,
        })
    }

    async fn charge_tokens(&self, tokens: u64, now: DateTime<Utc>) -> QueueResult<Window> {
        let mut slot = self.window.lock();
        let window = Window::current(&mut slot, now);
        window.tokens = window.tokens.saturating_add(tokens);
        Ok(*window)
    }

    async fn window(&self, now: DateTime<Utc>) -> QueueResult<Window> {
        let mut slot = self.window.lock();
        Ok(*Window::current(&mut slot, now))
    }

    async fn circuit_event(
        &self,
        event: CircuitEvent,
        config: CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> QueueResult<CircuitTransition> {
        Ok(self.circuit.lock().apply(event, &config, now))
    }

    async fn circuit(&self) -> QueueResult<CircuitSnapshot> {
        Ok(*self.circuit.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use admitq_core::clock;
    use std::time::Duration;

    const LIMITS: RateLimitConfig = RateLimitConfig {
        requests_per_minute: 2,
        tokens_per_minute: 100,
    };

    #[tokio::test]
    async fn refused_acquire_reports_the_window_unchanged() {
        let store = InMemoryAdmissionStore::new();
        let now = Utc::now();

        let first = store.acquire(LIMITS, 80, now).await.unwrap();
        assert!(first.granted);
        let refused = store.acquire(LIMITS, 30, now).await.unwrap();
        assert!(!refused.granted);
        assert_eq!(refused.window, first.window);
        assert_eq!(store.window(now).await.unwrap().tokens, 80);
    }

    #[tokio::test]
    async fn charges_land_in_a_fresh_window_after_rollover() {
        let store = InMemoryAdmissionStore::new();
        let now = Utc::now();
        store.acquire(LIMITS, 50, now).await.unwrap();

        let later = clock::after(now, Duration::from_secs(60));
        let window = store.charge_tokens(40, later).await.unwrap();
        assert_eq!(window.started_at, later);
        assert_eq!(window.tokens, 40);
        assert_eq!(window.requests, 0);
    }

    #[tokio::test]
    async fn circuit_starts_closed() {
        let store = InMemoryAdmissionStore::new();
        assert_eq!(store.circuit().await.unwrap().state, CircuitState::Closed);
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(5),
        };
        let opened = store
            .circuit_event(CircuitEvent::Failure, config, Utc::now())
            .await
            .unwrap();
        assert_eq!(opened.current.state, CircuitState::Open);
        assert_eq!(store.circuit().await.unwrap(), opened.current);
    }
}
