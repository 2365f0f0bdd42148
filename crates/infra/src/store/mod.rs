//! Storage backends for jobs and for shared admission state.
//!
//! Every method is one atomic state transition: implementations either apply
//! the whole transition or none of it. The [`JobQueue`](crate::queue::JobQueue)
//! facade layers the clock and configuration on top.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use admitq_core::{DeadLetterEntry, Job, JobId, LeaseId, QueueResult, Submission};

mod admission;
mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use admission::{AdmissionStore, InMemoryAdmissionStore};
pub use in_memory::InMemoryJobStore;

/// Storage abstraction behind the queue.
#[async_trait]
pub trait JobStore: Send + Sync + core::fmt::Debug {
    /// Insert a new Pending job unless a resident job carries the same
    /// idempotency key. Fails with `QueueFull` when `capacity` jobs are resident.
    async fn insert(&self, job: Job, capacity: usize) -> QueueResult<Submission>;

    /// Atomically claim the highest-priority eligible job, FIFO within a tier.
    async fn claim(&self, now: DateTime<Utc>, lease_ttl: Duration) -> QueueResult<Option<Job>>;

    async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>>;

    /// Mark the job succeeded and remove it.
    async fn ack(&self, job_id: JobId, lease: LeaseId) -> QueueResult<()>;

    /// Return a claimed job to Pending with no penalty.
    async fn release(&self, job_id: JobId, lease: LeaseId, now: DateTime<Utc>) -> QueueResult<()>;

    /// Return a failed job to Pending, eligible at `eligible_at`, charging one attempt.
    async fn requeue(
        &self,
        job_id: JobId,
        lease: LeaseId,
        eligible_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<RequeueOutcome>;

    /// Move a claimed job to the dead-letter sink. `charge_attempt` is false
    /// when the job is rejected without having been executed.
    async fn dead_letter(
        &self,
        job_id: JobId,
        lease: LeaseId,
        reason: &str,
        charge_attempt: bool,
        now: DateTime<Utc>,
    ) -> QueueResult<DeadLetterEntry>;

    async fn cancel(&self, job_id: JobId, now: DateTime<Utc>) -> QueueResult<CancelOutcome>;

    /// Return every InFlight job whose lease expired at or before `now` to Pending.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>>;

    /// Dead-lettered jobs, oldest first.
    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>>;

    async fn replay_dead_letter(
        &self,
        job_id: JobId,
        capacity: usize,
        now: DateTime<Utc>,
    ) -> QueueResult<Job>;

    async fn delete_dead_letter(&self, job_id: JobId) -> QueueResult<()>;

    async fn stats(&self, now: DateTime<Utc>) -> QueueResult<QueueStats>;

    async fn ping(&self) -> QueueResult<()>;
}

/// Result of [`JobStore::requeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued {
        attempt: u32,
        eligible_at: DateTime<Utc>,
    },
    /// Cancellation was requested while the job was in flight; it was removed.
    Cancelled { attempt: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was Pending and has been removed.
    Cancelled,
    /// The job is in flight; it will be dropped at its next retry decision.
    Requested,
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending and eligible now
    pub pending: usize,
    /// Pending but waiting out a backoff delay
    pub delayed: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
    pub succeeded: u64,
    pub cancelled: u64,
}

impl QueueStats {
    /// Jobs counted against `max_queue_size`.
    pub fn resident(&self) -> usize {
        self.pending + self.delayed + self.in_flight
    }
}
