//! Admission-gated dispatch of queued jobs to the external API.
//!
//! One [`Dispatcher::run_once`] call is one worker iteration: claim a job,
//! pass it through the rate limiter and circuit breaker, execute it under a
//! deadline, then settle it (ack, requeue with backoff, or dead-letter).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use admitq_core::{ExecutionError, Job, JobId, JobStatus, LeaseId, QueueError, QueueResult, RetryPolicy};

use crate::circuit_breaker::CircuitBreaker;
use crate::queue::{lease_of, JobQueue};
use crate::rate_limiter::RateLimiter;
use crate::store::RequeueOutcome;

mod pool;

pub use pool::{HealthReport, PoolStats, WorkerPool, WorkerPoolHandle};

/// Capacity of the outcome broadcast channel; slow subscribers lag, workers never block.
const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

/// Executes a job's payload against the external API.
///
/// Delivery is at-least-once, so implementations must tolerate re-execution.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<ExecutionReport, ExecutionError>;
}

/// What a successful call reports back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Real token usage, when the provider reports it
    pub tokens_used: Option<u64>,
}

impl ExecutionReport {
    pub fn with_tokens(tokens_used: u64) -> Self {
        Self {
            tokens_used: Some(tokens_used),
        }
    }
}

/// Adapter turning an async closure into a [`JobExecutor`].
pub struct FnExecutor<F>(pub F);

#[async_trait]
impl<F, Fut> JobExecutor for FnExecutor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ExecutionReport, ExecutionError>> + Send + 'static,
{
    async fn execute(&self, job: &Job) -> Result<ExecutionReport, ExecutionError> {
        (self.0)(job.clone()).await
    }
}

/// Why a claimed job was put back without being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDenied {
    RateLimited,
    CircuitOpen,
}

/// Notification published for every retry or terminal decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    /// `Failed` means a retry is scheduled
    pub status: JobStatus,
    pub attempt: u32,
    pub error: Option<String>,
}

/// Result of one dispatcher iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// Nothing eligible to claim
    Idle,
    /// The circuit is open; nothing was claimed
    Paused,
    /// A job was claimed and released without penalty
    Deferred { job_id: JobId, reason: AdmissionDenied },
    /// A job reached a retry or terminal decision
    Settled(JobOutcome),
    /// The job's lease was reclaimed before it could be settled
    LeaseLost(JobId),
}

pub struct Dispatcher {
    queue: JobQueue,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    executor: Arc<dyn JobExecutor>,
    call_timeout: Duration,
    outcomes: broadcast::Sender<JobOutcome>,
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        queue: JobQueue,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        executor: Arc<dyn JobExecutor>,
        call_timeout: Duration,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            queue,
            limiter,
            breaker,
            retry,
            executor,
            call_timeout,
            outcomes,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.outcomes.subscribe()
    }

    /// One worker iteration. Errors are store failures only; execution
    /// failures are settled and reported through the returned [`Tick`].
    pub async fn run_once(&self) -> QueueResult<Tick> {
        if self.breaker.is_blocking().await? {
            return Ok(Tick::Paused);
        }

        let Some(job) = self.queue.dequeue_next().await? else {
            return Ok(Tick::Idle);
        };
        let lease = lease_of(&job)?;

        if !self.limiter.admits(job.estimated_tokens) {
            let reason = format!(
                "estimated {} tokens exceeds the per-minute budget of {}",
                job.estimated_tokens,
                self.limiter.config().tokens_per_minute
            );
            let entry = self.settle_queue_op(&job, self.queue.reject(job.id, lease, &reason).await)?;
            return Ok(entry.map_or(Tick::LeaseLost(job.id), |entry| {
                self.publish(JobOutcome {
                    job_id: job.id,
                    status: JobStatus::DeadLettered,
                    attempt: entry.job.attempt,
                    error: Some(reason.clone()),
                })
            }));
        }

        if !self.limiter.try_acquire(job.estimated_tokens).await? {
            return self.defer(&job, lease, AdmissionDenied::RateLimited).await;
        }
        if !self.breaker.allow().await? {
            return self.defer(&job, lease, AdmissionDenied::CircuitOpen).await;
        }

        debug!(job_id = %job.id, priority = %job.priority, attempt = job.attempt, "dispatching job");
        match self.execute(&job).await {
            Ok(report) => self.succeed(&job, lease, report).await,
            Err(error) => self.fail(&job, lease, error).await,
        }
    }

    /// Run the executor on its own task under the call deadline. A panic in
    /// the executor becomes a terminal failure so the job and any probe it
    /// carries are still settled.
    async fn execute(&self, job: &Job) -> Result<ExecutionReport, ExecutionError> {
        let executor = self.executor.clone();
        let owned = job.clone();
        let mut call = tokio::spawn(async move { executor.execute(&owned).await });

        match tokio::time::timeout(self.call_timeout, &mut call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_panic() => {
                error!(job_id = %job.id, "executor panicked");
                Err(ExecutionError::terminal("executor panicked"))
            }
            Ok(Err(join)) => Err(ExecutionError::transient(format!("executor task failed: {join}"))),
            Err(_) => {
                call.abort();
                Err(ExecutionError::TimedOut(self.call_timeout))
            }
        }
    }

    async fn defer(&self, job: &Job, lease: LeaseId, reason: AdmissionDenied) -> QueueResult<Tick> {
        debug!(job_id = %job.id, reason = ?reason, "admission denied; releasing job");
        let released = self.settle_queue_op(job, self.queue.release(job.id, lease).await)?;
        Ok(released.map_or(Tick::LeaseLost(job.id), |()| Tick::Deferred {
            job_id: job.id,
            reason,
        }))
    }

    async fn succeed(&self, job: &Job, lease: LeaseId, report: ExecutionReport) -> QueueResult<Tick> {
        if let Some(actual) = report.tokens_used {
            self.note("token usage", self.limiter.record_usage(job.estimated_tokens, actual).await);
        }
        self.note("breaker success", self.breaker.record_success().await);

        let acked = self.settle_queue_op(job, self.queue.ack(job.id, lease).await)?;
        if acked.is_none() {
            return Ok(Tick::LeaseLost(job.id));
        }
        info!(job_id = %job.id, attempt = job.attempt, "job succeeded");
        Ok(self.publish(JobOutcome {
            job_id: job.id,
            status: JobStatus::Succeeded,
            attempt: job.attempt,
            error: None,
        }))
    }

    async fn fail(&self, job: &Job, lease: LeaseId, error: ExecutionError) -> QueueResult<Tick> {
        let message = error.to_string();

        if !error.is_retryable() {
            self.note("probe release", self.breaker.release_probe().await);
            warn!(job_id = %job.id, error = %message, "terminal failure");
            let entry = self.settle_queue_op(job, self.queue.dead_letter(job.id, lease, &message).await)?;
            return Ok(entry.map_or(Tick::LeaseLost(job.id), |entry| {
                self.publish(JobOutcome {
                    job_id: job.id,
                    status: JobStatus::DeadLettered,
                    attempt: entry.job.attempt,
                    error: Some(message.clone()),
                })
            }));
        }

        self.note("breaker failure", self.breaker.record_failure().await);

        if !self.retry.should_retry(job.attempt) {
            let reason = format!("retries exhausted after {} attempts: {message}", job.attempt + 1);
            let entry = self.settle_queue_op(job, self.queue.dead_letter(job.id, lease, &reason).await)?;
            return Ok(entry.map_or(Tick::LeaseLost(job.id), |entry| {
                self.publish(JobOutcome {
                    job_id: job.id,
                    status: JobStatus::DeadLettered,
                    attempt: entry.job.attempt,
                    error: Some(message.clone()),
                })
            }));
        }

        let delay = self.retry.next_delay(job.attempt);
        let outcome = self.settle_queue_op(job, self.queue.requeue(job.id, lease, delay, &message).await)?;
        Ok(match outcome {
            None => Tick::LeaseLost(job.id),
            Some(RequeueOutcome::Requeued { attempt, .. }) => {
                warn!(
                    job_id = %job.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "retryable failure; job requeued"
                );
                self.publish(JobOutcome {
                    job_id: job.id,
                    status: JobStatus::Failed,
                    attempt,
                    error: Some(message),
                })
            }
            Some(RequeueOutcome::Cancelled { attempt }) => {
                info!(job_id = %job.id, "cancelled at retry decision");
                self.publish(JobOutcome {
                    job_id: job.id,
                    status: JobStatus::Cancelled,
                    attempt,
                    error: Some(message),
                })
            }
        })
    }

    /// A lease lost to the sweeper is not an error for this worker: the job is
    /// someone else's now. Store failures propagate; the lease will expire.
    fn settle_queue_op<T>(&self, job: &Job, result: QueueResult<T>) -> QueueResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(QueueError::LeaseMismatch(_) | QueueError::NotFound(_)) => {
                warn!(job_id = %job.id, "lease lost before settlement");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Admission bookkeeping after a call must not keep the job from settling.
    fn note(&self, what: &'static str, result: QueueResult<()>) {
        if let Err(e) = result {
            warn!(error = %e, "{what} not recorded");
        }
    }

    fn publish(&self, outcome: JobOutcome) -> Tick {
        // No subscribers is fine.
        let _ = self.outcomes.send(outcome.clone());
        Tick::Settled(outcome)
    }
}
