//! Job model: immutable payload plus the scheduling metadata the dispatcher mutates.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::QueueError;
use crate::id::{JobId, LeaseId};
use crate::priority::Priority;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in its tier (possibly not yet eligible because of backoff)
    Pending,
    /// Claimed by exactly one worker under a lease
    InFlight,
    /// Executed successfully; removed from the queue
    Succeeded,
    /// Last attempt failed and a retry is scheduled
    Failed,
    /// Parked in the dead-letter sink for inspection/replay
    DeadLettered,
    /// Withdrawn before completion
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses leave the resident queue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::DeadLettered | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InFlight => "in_flight",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::DeadLettered => "dead_lettered",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_flight" => Ok(JobStatus::InFlight),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "dead_lettered" => Ok(JobStatus::DeadLettered),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(QueueError::serialization(format!("unknown job status '{other}'"))),
        }
    }
}

/// A worker's claim on an in-flight job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: LeaseId::new(),
            expires_at: clock::after(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A unit of work destined for the external API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub priority: Priority,
    /// Opaque to the queue; interpreted only by the executor
    pub payload: serde_json::Value,
    /// Tokens pre-charged against the per-minute budget at admission
    pub estimated_tokens: u64,
    pub idempotency_key: Option<String>,
    /// Number of failed executions so far (starts at 0)
    pub attempt: u32,
    /// FIFO position within the tier; assigned by the store
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    pub lease: Option<Lease>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
}

impl Job {
    /// Create a pending job that is eligible immediately.
    pub fn new(priority: Priority, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            priority,
            payload,
            estimated_tokens: 0,
            idempotency_key: None,
            attempt: 0,
            sequence: 0,
            enqueued_at: now,
            next_eligible_at: now,
            updated_at: now,
            status: JobStatus::Pending,
            lease: None,
            cancel_requested: false,
            last_error: None,
        }
    }

    pub fn from_request(request: EnqueueRequest, now: DateTime<Utc>) -> Self {
        let mut job = Self::new(request.priority, request.payload, now);
        job.estimated_tokens = request.estimated_tokens;
        job.idempotency_key = request.idempotency_key;
        job
    }

    /// Pending and past its backoff.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_eligible_at <= now
    }

    pub fn lease_id(&self) -> Option<LeaseId> {
        self.lease.map(|l| l.id)
    }

    /// True if `lease` is the live claim on this job.
    pub fn is_held_by(&self, lease: LeaseId) -> bool {
        self.status == JobStatus::InFlight && self.lease_id() == Some(lease)
    }
}

/// Producer-side submission.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub estimated_tokens: u64,
    pub idempotency_key: Option<String>,
}

impl EnqueueRequest {
    pub fn new(priority: Priority, payload: serde_json::Value) -> Self {
        Self {
            priority,
            payload,
            estimated_tokens: 0,
            idempotency_key: None,
        }
    }

    pub fn estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Created(JobId),
    /// A resident job already carries the same idempotency key
    Duplicate(JobId),
}

impl Submission {
    pub fn job_id(&self) -> JobId {
        match self {
            Submission::Created(id) | Submission::Duplicate(id) => *id,
        }
    }
}

/// Entry in the dead-letter sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_pending_and_eligible() {
        let now = Utc::now();
        let job = Job::new(Priority::Medium, serde_json::json!({"pdf": "a.pdf"}), now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 0);
        assert!(job.is_eligible(now));
        assert!(job.lease.is_none());
    }

    #[test]
    fn backoff_delays_eligibility() {
        let now = Utc::now();
        let mut job = Job::new(Priority::High, serde_json::json!({}), now);
        job.next_eligible_at = clock::after(now, Duration::from_secs(2));

        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(clock::after(now, Duration::from_secs(2))));
    }

    #[test]
    fn lease_ownership() {
        let now = Utc::now();
        let mut job = Job::new(Priority::Low, serde_json::json!({}), now);
        let lease = Lease::new(now, Duration::from_secs(30));
        job.status = JobStatus::InFlight;
        job.lease = Some(lease);

        assert!(job.is_held_by(lease.id));
        assert!(!job.is_held_by(LeaseId::new()));
        assert!(!lease.is_expired(now));
        assert!(lease.is_expired(clock::after(now, Duration::from_secs(30))));
    }

    #[test]
    fn request_carries_estimate_and_key() {
        let request = EnqueueRequest::new(Priority::High, serde_json::json!({"prompt": "hi"}))
            .estimated_tokens(1_500)
            .idempotency_key("lesson:42");
        let job = Job::from_request(request, Utc::now());

        assert_eq!(job.estimated_tokens, 1_500);
        assert_eq!(job.idempotency_key.as_deref(), Some("lesson:42"));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::InFlight,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::DeadLettered,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }
}
