//! In-process job store for tests, benchmarks and single-process deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use admitq_core::{
    DeadLetterEntry, Job, JobId, JobStatus, Lease, LeaseId, Priority, QueueError, QueueResult,
    Submission,
};

use super::{CancelOutcome, JobStore, QueueStats, RequeueOutcome};

/// In-memory store. All transitions run inside one short critical section.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    /// Resident jobs (Pending or InFlight)
    jobs: HashMap<JobId, Job>,
    /// Eligible Pending jobs per tier, keyed by FIFO sequence
    ready: [BTreeMap<u64, JobId>; 3],
    /// Pending jobs waiting out a backoff
    delayed: BTreeSet<(DateTime<Utc>, u64, JobId)>,
    /// Claimed jobs keyed by lease expiry
    in_flight: BTreeSet<(DateTime<Utc>, JobId)>,
    idempotency: HashMap<String, JobId>,
    dead: HashMap<JobId, DeadLetterEntry>,
    next_sequence: u64,
    succeeded: u64,
    cancelled: u64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl State {
    fn resident(&self) -> usize {
        self.jobs.len()
    }

    fn allocate_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Index a Pending job as ready or delayed depending on its eligibility.
    fn schedule(&mut self, job: &Job, now: DateTime<Utc>) {
        if job.next_eligible_at <= now {
            self.ready[job.priority.index()].insert(job.sequence, job.id);
        } else {
            self.delayed
                .insert((job.next_eligible_at, job.sequence, job.id));
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(&(at, seq, id)) = self.delayed.first() {
            if at > now {
                break;
            }
            self.delayed.pop_first();
            if let Some(job) = self.jobs.get(&id) {
                self.ready[job.priority.index()].insert(seq, id);
            }
        }
    }

    fn held(&self, job_id: JobId, lease: LeaseId) -> QueueResult<&Job> {
        let job = self.jobs.get(&job_id).ok_or(QueueError::NotFound(job_id))?;
        if !job.is_held_by(lease) {
            return Err(QueueError::LeaseMismatch(job_id));
        }
        Ok(job)
    }

    /// Drop the claim index entry and clear the lease.
    fn unclaim(&mut self, job_id: JobId) -> Option<&mut Job> {
        let job = self.jobs.get_mut(&job_id)?;
        if let Some(lease) = job.lease.take() {
            self.in_flight.remove(&(lease.expires_at, job_id));
        }
        Some(job)
    }

    /// Remove a job from the resident set and every index.
    fn evict(&mut self, job_id: JobId) -> Option<Job> {
        let mut job = self.jobs.remove(&job_id)?;
        self.ready[job.priority.index()].remove(&job.sequence);
        self.delayed
            .remove(&(job.next_eligible_at, job.sequence, job_id));
        if let Some(lease) = job.lease.take() {
            self.in_flight.remove(&(lease.expires_at, job_id));
        }
        if let Some(key) = job.idempotency_key.as_ref() {
            if self.idempotency.get(key) == Some(&job_id) {
                self.idempotency.remove(key);
            }
        }
        Some(job)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, mut job: Job, capacity: usize) -> QueueResult<Submission> {
        let mut state = self.state.lock();

        if let Some(key) = job.idempotency_key.as_ref() {
            if let Some(existing) = state.idempotency.get(key) {
                return Ok(Submission::Duplicate(*existing));
            }
        }
        if state.resident() >= capacity {
            return Err(QueueError::QueueFull { capacity });
        }

        job.sequence = state.allocate_sequence();
        job.status = JobStatus::Pending;
        let id = job.id;
        if let Some(key) = job.idempotency_key.clone() {
            state.idempotency.insert(key, id);
        }
        let now = job.enqueued_at;
        state.schedule(&job, now);
        state.jobs.insert(id, job);
        Ok(Submission::Created(id))
    }

    async fn claim(&self, now: DateTime<Utc>, lease_ttl: Duration) -> QueueResult<Option<Job>> {
        let mut state = self.state.lock();
        state.promote_due(now);

        let Some((tier, id)) = Priority::DISPATCH_ORDER.iter().find_map(|p| {
            state.ready[p.index()]
                .first_key_value()
                .map(|(_, id)| (p.index(), *id))
        }) else {
            return Ok(None);
        };
        state.ready[tier].pop_first();

        let lease = Lease::new(now, lease_ttl);
        state.in_flight.insert((lease.expires_at, id));
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::serialization(format!("ready index references missing job {id}")))?;
        job.status = JobStatus::InFlight;
        job.lease = Some(lease);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .get(&job_id)
            .cloned()
            .or_else(|| state.dead.get(&job_id).map(|e| e.job.clone())))
    }

    async fn ack(&self, job_id: JobId, lease: LeaseId) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.held(job_id, lease)?;
        state.evict(job_id);
        state.succeeded += 1;
        Ok(())
    }

    async fn release(&self, job_id: JobId, lease: LeaseId, now: DateTime<Utc>) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.held(job_id, lease)?;
        let Some(job) = state.unclaim(job_id) else {
            return Err(QueueError::NotFound(job_id));
        };
        job.status = JobStatus::Pending;
        job.updated_at = now;
        let job = job.clone();
        state.schedule(&job, now);
        Ok(())
    }

    async fn requeue(
        &self,
        job_id: JobId,
        lease: LeaseId,
        eligible_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<RequeueOutcome> {
        let mut state = self.state.lock();
        let cancel_requested = state.held(job_id, lease)?.cancel_requested;

        if cancel_requested {
            let attempt = state.evict(job_id).map(|j| j.attempt).unwrap_or_default();
            state.cancelled += 1;
            return Ok(RequeueOutcome::Cancelled { attempt });
        }

        let Some(job) = state.unclaim(job_id) else {
            return Err(QueueError::NotFound(job_id));
        };
        job.attempt += 1;
        job.status = JobStatus::Pending;
        job.next_eligible_at = eligible_at;
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        let job = job.clone();
        state.schedule(&job, now);
        Ok(RequeueOutcome::Requeued {
            attempt: job.attempt,
            eligible_at,
        })
    }

    async fn dead_letter(
        &self,
        job_id: JobId,
        lease: LeaseId,
        reason: &str,
        charge_attempt: bool,
        now: DateTime<Utc>,
    ) -> QueueResult<DeadLetterEntry> {
        let mut state = self.state.lock();
        state.held(job_id, lease)?;
        let Some(mut job) = state.evict(job_id) else {
            return Err(QueueError::NotFound(job_id));
        };

        if charge_attempt {
            job.attempt += 1;
        }
        job.status = JobStatus::DeadLettered;
        job.last_error = Some(reason.to_string());
        job.updated_at = now;
        let entry = DeadLetterEntry {
            job,
            reason: reason.to_string(),
            dead_lettered_at: now,
        };
        state.dead.insert(job_id, entry.clone());
        Ok(entry)
    }

    async fn cancel(&self, job_id: JobId, now: DateTime<Utc>) -> QueueResult<CancelOutcome> {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return match state.dead.get(&job_id) {
                Some(_) => Err(QueueError::InvalidState {
                    job_id,
                    status: JobStatus::DeadLettered.to_string(),
                    reason: "dead-lettered jobs are deleted, not cancelled",
                }),
                None => Err(QueueError::NotFound(job_id)),
            };
        };

        if job.status == JobStatus::InFlight {
            job.cancel_requested = true;
            job.updated_at = now;
            return Ok(CancelOutcome::Requested);
        }
        state.evict(job_id);
        state.cancelled += 1;
        Ok(CancelOutcome::Cancelled)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        let mut state = self.state.lock();
        let mut reclaimed = Vec::new();

        while let Some(&(expires_at, id)) = state.in_flight.first() {
            if expires_at > now {
                break;
            }
            state.in_flight.pop_first();
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if job.cancel_requested {
                state.evict(id);
                state.cancelled += 1;
                continue;
            }
            job.lease = None;
            job.status = JobStatus::Pending;
            job.updated_at = now;
            let job = job.clone();
            state.schedule(&job, now);
            reclaimed.push(id);
        }
        Ok(reclaimed)
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        let state = self.state.lock();
        let mut entries: Vec<DeadLetterEntry> = state.dead.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.dead_lettered_at
                .cmp(&b.dead_lettered_at)
                .then(a.job.id.cmp(&b.job.id))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn replay_dead_letter(
        &self,
        job_id: JobId,
        capacity: usize,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        let mut state = self.state.lock();
        if !state.dead.contains_key(&job_id) {
            return Err(QueueError::NotFound(job_id));
        }
        if state.resident() >= capacity {
            return Err(QueueError::QueueFull { capacity });
        }
        let Some(entry) = state.dead.remove(&job_id) else {
            return Err(QueueError::NotFound(job_id));
        };

        let mut job = entry.job;
        job.attempt = 0;
        job.sequence = state.allocate_sequence();
        job.status = JobStatus::Pending;
        job.next_eligible_at = now;
        job.lease = None;
        job.cancel_requested = false;
        job.updated_at = now;
        if let Some(key) = job.idempotency_key.clone() {
            state.idempotency.entry(key).or_insert(job_id);
        }
        state.schedule(&job, now);
        state.jobs.insert(job_id, job.clone());
        Ok(job)
    }

    async fn delete_dead_letter(&self, job_id: JobId) -> QueueResult<()> {
        let mut state = self.state.lock();
        state
            .dead
            .remove(&job_id)
            .map(|_| ())
            .ok_or(QueueError::NotFound(job_id))
    }

    async fn stats(&self, now: DateTime<Utc>) -> QueueResult<QueueStats> {
        let state = self.state.lock();
        let ready: usize = state.ready.iter().map(BTreeMap::len).sum();
        let due = state
            .delayed
            .iter()
            .take_while(|(at, _, _)| *at <= now)
            .count();
        Ok(QueueStats {
            pending: ready + due,
            delayed: state.delayed.len() - due,
            in_flight: state.in_flight.len(),
            dead_lettered: state.dead.len(),
            succeeded: state.succeeded,
            cancelled: state.cancelled,
        })
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use admitq_core::clock;

    const LEASE: Duration = Duration::from_secs(300);

    fn job(priority: Priority, now: DateTime<Utc>) -> Job {
        Job::new(priority, serde_json::json!({ "tier": priority.as_str() }), now)
    }

    #[tokio::test]
    async fn claims_by_tier_then_fifo() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let low = store.insert(job(Priority::Low, now), 10).await.unwrap().job_id();
        let high_a = store.insert(job(Priority::High, now), 10).await.unwrap().job_id();
        let medium = store.insert(job(Priority::Medium, now), 10).await.unwrap().job_id();
        let high_b = store.insert(job(Priority::High, now), 10).await.unwrap().job_id();

        let mut order = Vec::new();
        while let Some(claimed) = store.claim(now, LEASE).await.unwrap() {
            assert_eq!(claimed.status, JobStatus::InFlight);
            order.push(claimed.id);
        }
        assert_eq!(order, vec![high_a, high_b, medium, low]);
    }

    #[tokio::test]
    async fn capacity_counts_resident_jobs_only() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert(job(Priority::Low, now), 1).await.unwrap();

        let err = store.insert(job(Priority::High, now), 1).await.unwrap_err();
        assert_eq!(err, QueueError::QueueFull { capacity: 1 });

        let claimed = store.claim(now, LEASE).await.unwrap().unwrap();
        store
            .dead_letter(claimed.id, claimed.lease_id().unwrap(), "bad payload", true, now)
            .await
            .unwrap();
        assert!(store.insert(job(Priority::High, now), 1).await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_key_returns_existing_job() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let mut first = job(Priority::Medium, now);
        first.idempotency_key = Some("analysis:7".into());
        let mut second = job(Priority::Medium, now);
        second.idempotency_key = Some("analysis:7".into());

        let created = store.insert(first, 10).await.unwrap();
        let duplicate = store.insert(second, 10).await.unwrap();
        assert_eq!(duplicate, Submission::Duplicate(created.job_id()));

        let claimed = store.claim(now, LEASE).await.unwrap().unwrap();
        store.ack(claimed.id, claimed.lease_id().unwrap()).await.unwrap();

        let mut third = job(Priority::Medium, now);
        third.idempotency_key = Some("analysis:7".into());
        assert!(matches!(store.insert(third, 10).await.unwrap(), Submission::Created(_)));
    }

    #[tokio::test]
    async fn backoff_hides_job_until_eligible() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert(job(Priority::High, now), 10).await.unwrap();
        let claimed = store.claim(now, LEASE).await.unwrap().unwrap();

        let eligible_at = clock::after(now, Duration::from_secs(2));
        let outcome = store
            .requeue(claimed.id, claimed.lease_id().unwrap(), eligible_at, "502", now)
            .await
            .unwrap();
        assert_eq!(outcome, RequeueOutcome::Requeued { attempt: 1, eligible_at });

        let low = store.insert(job(Priority::Low, now), 10).await.unwrap().job_id();
        assert_eq!(store.claim(now, LEASE).await.unwrap().unwrap().id, low);
        assert!(store.claim(now, LEASE).await.unwrap().is_none());

        let stats = store.stats(now).await.unwrap();
        assert_eq!((stats.pending, stats.delayed, stats.in_flight), (0, 1, 1));

        let retried = store.claim(eligible_at, LEASE).await.unwrap().unwrap();
        assert_eq!(retried.id, claimed.id);
        assert_eq!(retried.attempt, 1);
    }

    #[tokio::test]
    async fn reclaimed_lease_is_stale() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert(job(Priority::Low, now), 10).await.unwrap();
        let first = store.claim(now, LEASE).await.unwrap().unwrap();

        let later = clock::after(now, LEASE);
        assert_eq!(store.reclaim_expired(later).await.unwrap(), vec![first.id]);
        let second = store.claim(later, LEASE).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 0);

        let err = store.ack(first.id, first.lease_id().unwrap()).await.unwrap_err();
        assert_eq!(err, QueueError::LeaseMismatch(first.id));
        store.ack(second.id, second.lease_id().unwrap()).await.unwrap();
        assert_eq!(store.stats(later).await.unwrap().succeeded, 1);
    }

    #[tokio::test]
    async fn release_keeps_fifo_position() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let first = store.insert(job(Priority::Medium, now), 10).await.unwrap().job_id();
        store.insert(job(Priority::Medium, now), 10).await.unwrap();

        let claimed = store.claim(now, LEASE).await.unwrap().unwrap();
        store.release(claimed.id, claimed.lease_id().unwrap(), now).await.unwrap();

        let again = store.claim(now, LEASE).await.unwrap().unwrap();
        assert_eq!(again.id, first);
        assert_eq!(again.attempt, 0);
    }

    #[tokio::test]
    async fn cancel_pending_and_in_flight() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let pending = store.insert(job(Priority::Low, now), 10).await.unwrap().job_id();
        let running = store.insert(job(Priority::High, now), 10).await.unwrap().job_id();
        let claimed = store.claim(now, LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, running);

        assert_eq!(store.cancel(pending, now).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(store.cancel(running, now).await.unwrap(), CancelOutcome::Requested);
        assert!(store.get(pending).await.unwrap().is_none());

        let outcome = store
            .requeue(running, claimed.lease_id().unwrap(), now, "timeout", now)
            .await
            .unwrap();
        assert_eq!(outcome, RequeueOutcome::Cancelled { attempt: 0 });
        assert_eq!(store.stats(now).await.unwrap().cancelled, 2);
        assert_eq!(store.cancel(running, now).await.unwrap_err(), QueueError::NotFound(running));
    }

    #[tokio::test]
    async fn replay_resets_attempts() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert(job(Priority::High, now), 10).await.unwrap();
        let claimed = store.claim(now, LEASE).await.unwrap().unwrap();
        let entry = store
            .dead_letter(claimed.id, claimed.lease_id().unwrap(), "exhausted", true, now)
            .await
            .unwrap();
        assert_eq!(entry.job.attempt, 1);
        assert_eq!(entry.job.status, JobStatus::DeadLettered);

        let listed = store.dead_letters(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reason, "exhausted");

        let replayed = store.replay_dead_letter(claimed.id, 10, now).await.unwrap();
        assert_eq!(replayed.attempt, 0);
        assert_eq!(replayed.status, JobStatus::Pending);
        assert!(replayed.sequence > claimed.sequence);
        assert!(store.dead_letters(10).await.unwrap().is_empty());
        assert_eq!(
            store.delete_dead_letter(claimed.id).await.unwrap_err(),
            QueueError::NotFound(claimed.id)
        );
    }
}
