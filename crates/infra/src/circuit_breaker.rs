//! Consecutive-failure circuit breaker guarding the external API.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use admitq_core::clock::{self, Clock};
use admitq_core::{CircuitBreakerConfig, QueueResult};

use crate::store::{AdmissionStore, InMemoryAdmissionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    /// One probe call is outstanding
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

/// Something that moves the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    Allow,
    Success,
    Failure,
    /// The probe ended without a provider verdict
    ReleaseProbe,
}

impl CircuitEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitEvent::Allow => "allow",
            CircuitEvent::Success => "success",
            CircuitEvent::Failure => "failure",
            CircuitEvent::ReleaseProbe => "release_probe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// State before and after one [`CircuitEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTransition {
    pub previous: CircuitState,
    pub current: CircuitSnapshot,
}

impl CircuitTransition {
    /// For [`CircuitEvent::Allow`]: whether the caller may proceed.
    pub fn admitted(&self) -> bool {
        match (self.previous, self.current.state) {
            (CircuitState::Closed, _) => true,
            (CircuitState::Open, CircuitState::HalfOpen) => true,
            _ => false,
        }
    }
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

impl CircuitSnapshot {
    /// Apply one event. Stores call this under their own atomicity guarantee.
    pub fn apply(
        &mut self,
        event: CircuitEvent,
        config: &CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> CircuitTransition {
        let previous = self.state;
        match event {
            CircuitEvent::Allow => {
                if previous == CircuitState::Open && self.cooled_down(config, now) {
                    self.state = CircuitState::HalfOpen;
                }
            }
            CircuitEvent::Success => {
                // A call sent before the circuit tripped may land while it is
                // Open; the timer still runs to completion.
                self.consecutive_failures = 0;
                if previous != CircuitState::Open {
                    self.state = CircuitState::Closed;
                    self.opened_at = None;
                }
            }
            CircuitEvent::Failure => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let trips = match previous {
                    CircuitState::HalfOpen => true,
                    CircuitState::Closed => self.consecutive_failures >= config.failure_threshold,
                    CircuitState::Open => false,
                };
                if trips {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitEvent::ReleaseProbe => {
                if previous == CircuitState::HalfOpen {
                    self.state = CircuitState::Open;
                }
            }
        }
        CircuitTransition {
            previous,
            current: *self,
        }
    }

    /// True while every caller would be refused (Open within its timeout,
    /// or a probe outstanding).
    pub fn is_blocking(&self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => true,
            CircuitState::Open => !self.cooled_down(config, now),
        }
    }

    fn cooled_down(&self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> bool {
        self.opened_at
            .is_none_or(|at| clock::elapsed(at, now) >= config.reset_timeout)
    }
}

/// Closed → Open after `failure_threshold` consecutive failures; Open admits
/// exactly one probe once `reset_timeout` has elapsed; the probe's verdict
/// closes the circuit or reopens it with a fresh timer.
///
/// State lives in an [`AdmissionStore`]; breakers over the same store trip together.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn AdmissionStore>,
}

impl CircuitBreaker {
    pub fn new(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn AdmissionStore>,
    ) -> Self {
        Self {
            config,
            clock,
            store,
        }
    }

    /// A breaker whose state is private to this process.
    pub fn in_memory(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config, clock, InMemoryAdmissionStore::arc())
    }

    pub async fn allow(&self) -> QueueResult<bool> {
        let transition = self.apply(CircuitEvent::Allow).await?;
        if transition.previous == CircuitState::Open && transition.current.state == CircuitState::HalfOpen {
            info!("circuit half-open; admitting probe");
        }
        Ok(transition.admitted())
    }

    /// Read-only check: true while the circuit would refuse every caller.
    pub async fn is_blocking(&self) -> QueueResult<bool> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.is_blocking(&self.config, self.clock.now()))
    }

    pub async fn record_success(&self) -> QueueResult<()> {
        let transition = self.apply(CircuitEvent::Success).await?;
        match transition.previous {
            CircuitState::HalfOpen => info!("probe succeeded; circuit closed"),
            CircuitState::Open => debug!("late success while open; timer unchanged"),
            CircuitState::Closed => {}
        }
        Ok(())
    }

    pub async fn record_failure(&self) -> QueueResult<()> {
        let transition = self.apply(CircuitEvent::Failure).await?;
        let current = transition.current;
        match (transition.previous, current.state) {
            (CircuitState::HalfOpen, CircuitState::Open) => {
                warn!(failures = current.consecutive_failures, "probe failed; circuit reopened")
            }
            (CircuitState::Closed, CircuitState::Open) => warn!(
                failures = current.consecutive_failures,
                timeout_secs = self.config.reset_timeout.as_secs(),
                "circuit opened"
            ),
            _ => {}
        }
        Ok(())
    }

    /// The probe ended without a provider verdict; let the next caller probe.
    pub async fn release_probe(&self) -> QueueResult<()> {
        self.apply(CircuitEvent::ReleaseProbe).await.map(|_| ())
    }

    pub async fn state(&self) -> QueueResult<CircuitState> {
        Ok(self.snapshot().await?.state)
    }

    pub async fn snapshot(&self) -> QueueResult<CircuitSnapshot> {
        self.store.circuit().await
    }

    async fn apply(&self, event: CircuitEvent) -> QueueResult<CircuitTransition> {
        self.store
            .circuit_event(event, self.config, self.clock.now())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use admitq_core::ManualClock;
    use std::time::Duration;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    fn breaker() -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = ManualClock::starting_now();
        let breaker = CircuitBreaker::in_memory(config(), clock.clone());
        (clock, breaker)
    }

    async fn trip(breaker: &CircuitBreaker) {
        for _ in 0..5 {
            breaker.record_failure().await.unwrap();
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_and_closes_on_probe_success() {
        let (clock, breaker) = breaker();
        for _ in 0..4 {
            breaker.record_failure().await.unwrap();
        }
        assert!(breaker.allow().await.unwrap());
        breaker.record_failure().await.unwrap();
        assert!(!breaker.allow().await.unwrap());
        assert!(breaker.is_blocking().await.unwrap());

        clock.advance(Duration::from_secs(60));
        assert!(!breaker.is_blocking().await.unwrap());
        assert!(breaker.allow().await.unwrap());
        assert_eq!(breaker.state().await.unwrap(), CircuitState::HalfOpen);

        breaker.record_success().await.unwrap();
        assert!(breaker.allow().await.unwrap());
        assert!(breaker.allow().await.unwrap());
        assert_eq!(breaker.snapshot().await.unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn single_probe_then_reopen_on_failure() {
        let (clock, breaker) = breaker();
        trip(&breaker).await;
        clock.advance(Duration::from_secs(61));

        assert!(breaker.allow().await.unwrap());
        assert!(!breaker.allow().await.unwrap());
        assert!(!breaker.allow().await.unwrap());

        breaker.record_failure().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);
        assert!(!breaker.allow().await.unwrap());
        clock.advance(Duration::from_secs(59));
        assert!(!breaker.allow().await.unwrap());
        clock.advance(Duration::from_secs(1));
        assert!(breaker.allow().await.unwrap());
    }

    #[tokio::test]
    async fn late_success_does_not_cut_the_open_timer_short() {
        let (clock, breaker) = breaker();
        trip(&breaker).await;
        let opened_at = breaker.snapshot().await.unwrap().opened_at;

        breaker.record_success().await.unwrap();
        let snapshot = breaker.snapshot().await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.opened_at, opened_at);
        assert_eq!(snapshot.consecutive_failures, 0);

        clock.advance(Duration::from_secs(1));
        assert!(!breaker.allow().await.unwrap());
        clock.advance(Duration::from_secs(58));
        assert!(!breaker.allow().await.unwrap());
        clock.advance(Duration::from_secs(1));
        assert!(breaker.allow().await.unwrap());
        assert_eq!(breaker.state().await.unwrap(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn released_probe_can_be_retaken() {
        let (clock, breaker) = breaker();
        trip(&breaker).await;
        clock.advance(Duration::from_secs(60));

        assert!(breaker.allow().await.unwrap());
        breaker.release_probe().await.unwrap();
        assert!(breaker.allow().await.unwrap());
        assert!(!breaker.allow().await.unwrap());
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let (_, breaker) = breaker();
        for _ in 0..4 {
            breaker.record_failure().await.unwrap();
        }
        breaker.record_success().await.unwrap();
        for _ in 0..4 {
            breaker.record_failure().await.unwrap();
        }
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn breakers_over_one_store_trip_together() {
        let clock = ManualClock::starting_now();
        let store = InMemoryAdmissionStore::arc();
        let first = CircuitBreaker::new(config(), clock.clone(), store.clone());
        let second = CircuitBreaker::new(config(), clock.clone(), store);

        for _ in 0..3 {
            first.record_failure().await.unwrap();
        }
        for _ in 0..2 {
            second.record_failure().await.unwrap();
        }
        assert!(!first.allow().await.unwrap());
        assert!(second.is_blocking().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_get_one_probe() {
        let (clock, breaker) = breaker();
        trip(&breaker).await;
        clock.advance(Duration::from_secs(60));

        let breaker = Arc::new(breaker);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                tokio::spawn(async move { breaker.allow().await.unwrap() })
            })
            .collect();
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[test]
    fn events_map_to_transitions() {
        let config = config();
        let now = Utc::now();
        let mut snapshot = CircuitSnapshot::default();

        assert!(snapshot.apply(CircuitEvent::Allow, &config, now).admitted());
        for _ in 0..5 {
            snapshot.apply(CircuitEvent::Failure, &config, now);
        }
        let refused = snapshot.apply(CircuitEvent::Allow, &config, now);
        assert!(!refused.admitted());
        assert_eq!(refused.current.opened_at, Some(now));

        let later = clock::after(now, config.reset_timeout);
        let probe = snapshot.apply(CircuitEvent::Allow, &config, later);
        assert!(probe.admitted());
        assert_eq!(probe.current.state, CircuitState::HalfOpen);
        assert!(!snapshot.apply(CircuitEvent::Allow, &config, later).admitted());

        let closed = snapshot.apply(CircuitEvent::Success, &config, later);
        assert_eq!(closed.previous, CircuitState::HalfOpen);
        assert_eq!(closed.current, CircuitSnapshot::default());
    }

    #[test]
    fn state_names_parse_back() {
        for state in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
            assert_eq!(CircuitState::parse(state.as_str()), Some(state));
        }
        assert_eq!(CircuitState::parse("ajar"), None);
    }
}
