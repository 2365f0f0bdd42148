#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use admitq_core::{ExecutionError, Job, ManualClock, QueueConfig};
use admitq_infra::{
    CircuitBreaker, Dispatcher, ExecutionReport, InMemoryJobStore, JobExecutor, JobQueue,
    RateLimiter,
};

/// Executor replaying a fixed script of results, then succeeding.
#[derive(Default)]
pub struct Scripted {
    results: Mutex<VecDeque<Result<ExecutionReport, ExecutionError>>>,
    calls: AtomicUsize,
}

impl Scripted {
    pub fn new(results: impl IntoIterator<Item = Result<ExecutionReport, ExecutionError>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for Scripted {
    async fn execute(&self, _job: &Job) -> Result<ExecutionReport, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .lock()
            .pop_front()
            .unwrap_or(Ok(ExecutionReport::default()))
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub queue: JobQueue,
    pub dispatcher: Dispatcher,
}

pub fn test_config() -> QueueConfig {
    let mut config = QueueConfig::development();
    config.max_queue_size = 100;
    config.worker.call_timeout = Duration::from_secs(5);
    config.worker.visibility_timeout = Duration::from_secs(30);
    config
}

pub fn harness(config: &QueueConfig, executor: Arc<dyn JobExecutor>) -> Harness {
    let clock = ManualClock::starting_now();
    let queue = JobQueue::from_config(InMemoryJobStore::arc(), clock.clone(), config);
    let dispatcher = Dispatcher::new(
        queue.clone(),
        Arc::new(RateLimiter::in_memory(config.rate_limit, clock.clone())),
        Arc::new(CircuitBreaker::in_memory(config.circuit_breaker, clock.clone())),
        config.retry,
        executor,
        config.worker.call_timeout,
    );
    Harness {
        clock,
        queue,
        dispatcher,
    }
}
