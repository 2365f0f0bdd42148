//! Priority-ordered job queue over a [`JobStore`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use admitq_core::clock::{self, Clock};
use admitq_core::{
    DeadLetterEntry, EnqueueRequest, Job, JobId, LeaseId, Priority, QueueConfig, QueueError,
    QueueResult, Submission,
};

use crate::store::{CancelOutcome, JobStore, QueueStats, RequeueOutcome};

/// Producer- and dispatcher-facing queue handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    max_queue_size: usize,
    visibility_timeout: Duration,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        max_queue_size: usize,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            max_queue_size,
            visibility_timeout,
        }
    }

    pub fn from_config(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, config: &QueueConfig) -> Self {
        Self::new(
            store,
            clock,
            config.max_queue_size,
            config.worker.visibility_timeout,
        )
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Enqueue a job with no idempotency key and no token estimate.
    pub async fn enqueue(&self, priority: Priority, payload: serde_json::Value) -> QueueResult<JobId> {
        self.submit(EnqueueRequest::new(priority, payload))
            .await
            .map(|s| s.job_id())
    }

    pub async fn submit(&self, request: EnqueueRequest) -> QueueResult<Submission> {
        let job = Job::from_request(request, self.clock.now());
        let priority = job.priority;
        let submission = self.store.insert(job, self.max_queue_size).await?;
        match submission {
            Submission::Created(id) => debug!(job_id = %id, priority = %priority, "job enqueued"),
            Submission::Duplicate(id) => {
                debug!(job_id = %id, priority = %priority, "duplicate submission ignored")
            }
        }
        Ok(submission)
    }

    /// Claim the highest-priority eligible job, if any. Never blocks waiting for work.
    pub async fn dequeue_next(&self) -> QueueResult<Option<Job>> {
        self.store
            .claim(self.clock.now(), self.visibility_timeout)
            .await
    }

    pub async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        self.store.get(job_id).await
    }

    pub async fn ack(&self, job_id: JobId, lease: LeaseId) -> QueueResult<()> {
        self.store.ack(job_id, lease).await
    }

    /// Put a claimed job back untouched (flow control, not failure).
    pub async fn release(&self, job_id: JobId, lease: LeaseId) -> QueueResult<()> {
        self.store.release(job_id, lease, self.clock.now()).await
    }

    pub async fn requeue(
        &self,
        job_id: JobId,
        lease: LeaseId,
        delay: Duration,
        error: &str,
    ) -> QueueResult<RequeueOutcome> {
        let now = self.clock.now();
        self.store
            .requeue(job_id, lease, clock::after(now, delay), error, now)
            .await
    }

    /// Dead-letter a job after a failed execution (charges the attempt).
    pub async fn dead_letter(
        &self,
        job_id: JobId,
        lease: LeaseId,
        reason: &str,
    ) -> QueueResult<DeadLetterEntry> {
        let entry = self
            .store
            .dead_letter(job_id, lease, reason, true, self.clock.now())
            .await?;
        warn!(job_id = %job_id, attempts = entry.job.attempt, reason, "job dead-lettered");
        Ok(entry)
    }

    /// Dead-letter a job that was never executed.
    pub async fn reject(
        &self,
        job_id: JobId,
        lease: LeaseId,
        reason: &str,
    ) -> QueueResult<DeadLetterEntry> {
        let entry = self
            .store
            .dead_letter(job_id, lease, reason, false, self.clock.now())
            .await?;
        warn!(job_id = %job_id, reason, "job rejected");
        Ok(entry)
    }

    pub async fn cancel(&self, job_id: JobId) -> QueueResult<CancelOutcome> {
        let outcome = self.store.cancel(job_id, self.clock.now()).await?;
        info!(job_id = %job_id, outcome = ?outcome, "cancellation");
        Ok(outcome)
    }

    /// Return jobs whose lease expired to Pending, attempt unchanged.
    pub async fn reclaim_expired(&self) -> QueueResult<Vec<JobId>> {
        let reclaimed = self.store.reclaim_expired(self.clock.now()).await?;
        for job_id in &reclaimed {
            warn!(job_id = %job_id, "lease expired; job returned to pending");
        }
        Ok(reclaimed)
    }

    pub async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        self.store.dead_letters(limit).await
    }

    pub async fn replay_dead_letter(&self, job_id: JobId) -> QueueResult<Job> {
        let job = self
            .store
            .replay_dead_letter(job_id, self.max_queue_size, self.clock.now())
            .await?;
        info!(job_id = %job_id, priority = %job.priority, "dead letter replayed");
        Ok(job)
    }

    pub async fn delete_dead_letter(&self, job_id: JobId) -> QueueResult<()> {
        self.store.delete_dead_letter(job_id).await?;
        info!(job_id = %job_id, "dead letter deleted");
        Ok(())
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        self.store.stats(self.clock.now()).await
    }

    pub async fn ping(&self) -> QueueResult<()> {
        self.store.ping().await
    }
}

/// Lease of a job returned by [`JobQueue::dequeue_next`].
pub(crate) fn lease_of(job: &Job) -> QueueResult<LeaseId> {
    job.lease_id().ok_or(QueueError::InvalidState {
        job_id: job.id,
        status: job.status.to_string(),
        reason: "job has no lease",
    })
}
