//! Job queue: durable, at-least-once hand-off of work to workers.
//!
//! Delivery is lease based. `dequeue` atomically moves the best eligible job
//! to `active` and hands out a lease token; acknowledgements (`complete`,
//! `fail`, `retry_later`) must present the current token. A worker that dies
//! stops extending its lease and the job becomes eligible again once the lease
//! expires.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use civic_core::{JobId, OwnerId};
use civic_pipeline::{Job, JobOptions, JobOutcome, JobPayload, JobStatus};

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job not found in queue: {0}")]
    NotFound(JobId),
    #[error("job already queued: {0}")]
    AlreadyExists(JobId),
    /// The caller's lease expired or was superseded by a redelivery.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt queue entry for job {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Storage(err.to_string())
    }
}

/// What the queue needs to run a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub owner_id: OwnerId,
    pub payload: JobPayload,
    pub options: JobOptions,
    /// Not eligible before this instant.
    pub available_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            owner_id: job.owner_id,
            payload: job.payload.clone(),
            options: job.options.clone(),
            available_at: job.eligible_at(),
        }
    }
}

/// Proof of ownership of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub entry: QueueEntry,
    pub lease: Lease,
    /// 1 for the first delivery, incremented on every redelivery.
    pub attempt: u32,
}

/// The queue's own view of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueState {
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub result: Option<JobOutcome>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Queue depth by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub fn add(&mut self, status: JobStatus, n: usize) {
        let slot = match status {
            JobStatus::Waiting => &mut self.waiting,
            JobStatus::Active => &mut self.active,
            JobStatus::Delayed => &mut self.delayed,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += n;
    }
}

/// Queue abstraction.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Persist a new entry. Never waits on processing.
    async fn submit(&self, entry: QueueEntry) -> Result<JobId, QueueError>;

    /// Lease the next eligible job: priority first, then FIFO.
    ///
    /// Eligible means `waiting`, `delayed` past its `available_at`, or
    /// `active` with an expired lease.
    async fn dequeue(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Delivery>, QueueError>;

    /// Park until new work may be available or `max` elapses.
    async fn wait_for_work(&self, max: Duration) {
        tokio::time::sleep(max).await;
    }

    async fn extend_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, QueueError>;

    async fn complete(&self, lease: &Lease, outcome: &JobOutcome) -> Result<(), QueueError>;

    async fn fail(&self, lease: &Lease, error: &str) -> Result<(), QueueError>;

    /// Release the lease and re-admit the job after `delay`.
    async fn retry_later(&self, lease: &Lease, delay: Duration) -> Result<(), QueueError>;

    /// Cancel a job that is not running. Returns `false` when the job is
    /// active or already finished.
    async fn cancel(&self, id: JobId) -> Result<bool, QueueError>;

    /// Fail a job regardless of lease. Returns `false` when already finished
    /// or unknown.
    async fn force_fail(&self, id: JobId, error: &str) -> Result<bool, QueueError>;

    async fn state(&self, id: JobId) -> Result<Option<QueueState>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Hard-delete finished entries older than `cutoff`.
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError>;
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

pub(crate) fn available_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

#[derive(Debug, Clone)]
struct Record {
    seq: u64,
    entry: QueueEntry,
    status: JobStatus,
    attempts: u32,
    lease_token: Option<Uuid>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    error: Option<String>,
    result: Option<JobOutcome>,
    finished_at: Option<DateTime<Utc>>,
}

impl Record {
    fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Waiting => self.entry.available_at <= now,
            JobStatus::Delayed => self.entry.available_at <= now,
            JobStatus::Active => self.lease_expires_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }

    fn holds(&self, lease: &Lease) -> bool {
        self.status == JobStatus::Active && self.lease_token == Some(lease.token)
    }

    fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.lease_token = None;
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.finished_at = Some(now);
    }

    fn state(&self) -> QueueState {
        QueueState {
            status: self.status,
            attempts: self.attempts,
            error: self.error.clone(),
            result: self.result.clone(),
            lease_expires_at: self.lease_expires_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    records: HashMap<JobId, Record>,
}

/// In-memory queue for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    inner: RwLock<Inner>,
    notify: Arc<Notify>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Forget a job entirely, as a queue backend that lost its data would.
    pub fn remove(&self, id: JobId) -> bool {
        self.inner
            .write()
            .map(|mut inner| inner.records.remove(&id).is_some())
            .unwrap_or(false)
    }

    /// Expire the current lease on `id` immediately.
    pub fn expire_lease(&self, id: JobId) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        if let Some(record) = inner.records.get_mut(&id) {
            if record.status == JobStatus::Active {
                record.lease_expires_at = Some(Utc::now() - chrono::Duration::milliseconds(1));
            }
        }
    }

    fn with_lease<F>(&self, lease: &Lease, apply: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut Record, DateTime<Utc>),
    {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let record = inner
            .records
            .get_mut(&lease.job_id)
            .ok_or(QueueError::NotFound(lease.job_id))?;
        if !record.holds(lease) {
            return Err(QueueError::LeaseLost(lease.job_id));
        }
        apply(record, Utc::now());
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> QueueError {
    QueueError::Storage("queue lock poisoned".to_string())
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn submit(&self, entry: QueueEntry) -> Result<JobId, QueueError> {
        let id = entry.job_id;
        {
            let mut inner = self.inner.write().map_err(poisoned)?;
            if inner.records.contains_key(&id) {
                return Err(QueueError::AlreadyExists(id));
            }
            inner.next_seq += 1;
            let status = if entry.available_at > Utc::now() {
                JobStatus::Delayed
            } else {
                JobStatus::Waiting
            };
            let record = Record {
                seq: inner.next_seq,
                entry,
                status,
                attempts: 0,
                lease_token: None,
                lease_owner: None,
                lease_expires_at: None,
                error: None,
                result: None,
                finished_at: None,
            };
            inner.records.insert(id, record);
        }

        debug!(job_id = %id, "job queued");
        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let now = Utc::now();

        let next = inner
            .records
            .values()
            .filter(|r| r.is_eligible(now))
            .min_by_key(|r| (std::cmp::Reverse(r.entry.options.priority), r.seq))
            .map(|r| r.entry.job_id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(record) = inner.records.get_mut(&id) else {
            return Ok(None);
        };

        if record.status == JobStatus::Active {
            info!(
                job_id = %id,
                previous_owner = record.lease_owner.as_deref().unwrap_or("unknown"),
                "lease expired, redelivering"
            );
        }

        let token = Uuid::now_v7();
        let expires_at = lease_expiry(now, lease_ttl);
        record.status = JobStatus::Active;
        record.attempts += 1;
        record.lease_token = Some(token);
        record.lease_owner = Some(worker_id.to_string());
        record.lease_expires_at = Some(expires_at);

        Ok(Some(Delivery {
            entry: record.entry.clone(),
            lease: Lease {
                job_id: id,
                token,
                expires_at,
            },
            attempt: record.attempts,
        }))
    }

    async fn wait_for_work(&self, max: Duration) {
        let _ = tokio::time::timeout(max, self.notify.notified()).await;
    }

    async fn extend_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, QueueError> {
        let mut extended = lease.clone();
        self.with_lease(lease, |record, now| {
            let expires_at = lease_expiry(now, ttl);
            record.lease_expires_at = Some(expires_at);
            extended.expires_at = expires_at;
        })?;
        Ok(extended)
    }

    async fn complete(&self, lease: &Lease, outcome: &JobOutcome) -> Result<(), QueueError> {
        self.with_lease(lease, |record, now| {
            record.result = Some(outcome.clone());
            record.error = None;
            record.finish(JobStatus::Completed, now);
        })
    }

    async fn fail(&self, lease: &Lease, error: &str) -> Result<(), QueueError> {
        self.with_lease(lease, |record, now| {
            record.error = Some(error.to_string());
            record.finish(JobStatus::Failed, now);
        })
    }

    async fn retry_later(&self, lease: &Lease, delay: Duration) -> Result<(), QueueError> {
        self.with_lease(lease, |record, now| {
            record.status = JobStatus::Delayed;
            record.entry.available_at = available_after(now, delay);
            record.lease_token = None;
            record.lease_owner = None;
            record.lease_expires_at = None;
        })?;
        self.notify.notify_one();
        Ok(())
    }

    async fn cancel(&self, id: JobId) -> Result<bool, QueueError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let record = inner.records.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        match record.status {
            JobStatus::Waiting | JobStatus::Delayed => {
                record.finish(JobStatus::Cancelled, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_fail(&self, id: JobId, error: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        match inner.records.get_mut(&id) {
            Some(record) if !record.status.is_terminal() => {
                record.error = Some(error.to_string());
                record.finish(JobStatus::Failed, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn state(&self, id: JobId) -> Result<Option<QueueState>, QueueError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.records.get(&id).map(Record::state))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut stats = QueueStats::default();
        for record in inner.records.values() {
            stats.add(record.status, 1);
        }
        Ok(stats)
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let before = inner.records.len();
        inner
            .records
            .retain(|_, r| !(r.status.is_terminal() && r.finished_at.is_some_and(|at| at < cutoff)));
        Ok(before - inner.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(priority: i32) -> QueueEntry {
        let job = Job::new(
            OwnerId::new(),
            JobPayload::new("file:///tmp/a.wav", serde_json::json!({})),
            JobOptions::default().with_priority(priority),
            Utc::now(),
        );
        QueueEntry::for_job(&job)
    }

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn fifo_within_priority_and_priority_first() {
        let queue = InMemoryJobQueue::new();
        let a = queue.submit(entry(0)).await.unwrap();
        let b = queue.submit(entry(0)).await.unwrap();
        let urgent = queue.submit(entry(5)).await.unwrap();

        let order: Vec<JobId> = [
            queue.dequeue("w", TTL).await.unwrap().unwrap(),
            queue.dequeue("w", TTL).await.unwrap().unwrap(),
            queue.dequeue("w", TTL).await.unwrap().unwrap(),
        ]
        .iter()
        .map(|d| d.entry.job_id)
        .collect();

        assert_eq!(order, vec![urgent, a, b]);
        assert!(queue.dequeue("w", TTL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn active_job_is_not_delivered_twice() {
        let queue = InMemoryJobQueue::new();
        queue.submit(entry(0)).await.unwrap();

        let first = queue.dequeue("w1", TTL).await.unwrap();
        let second = queue.dequeue("w2", TTL).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_old_lease_rejected() {
        let queue = InMemoryJobQueue::new();
        let id = queue.submit(entry(0)).await.unwrap();

        let first = queue.dequeue("w1", TTL).await.unwrap().unwrap();
        queue.expire_lease(id);

        let second = queue.dequeue("w2", TTL).await.unwrap().unwrap();
        assert_eq!(second.entry.job_id, id);
        assert_eq!(second.attempt, 2);

        let outcome = JobOutcome {
            record_id: "r".to_string(),
            summary: serde_json::Value::Null,
        };
        assert!(matches!(
            queue.complete(&first.lease, &outcome).await,
            Err(QueueError::LeaseLost(_))
        ));
        queue.complete(&second.lease, &outcome).await.unwrap();

        let state = queue.state(id).await.unwrap().unwrap();
        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(state.result, Some(outcome));
    }

    #[tokio::test]
    async fn retry_later_delays_redelivery() {
        let queue = InMemoryJobQueue::new();
        let id = queue.submit(entry(0)).await.unwrap();
        let delivery = queue.dequeue("w", TTL).await.unwrap().unwrap();

        queue
            .retry_later(&delivery.lease, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(
            queue.state(id).await.unwrap().unwrap().status,
            JobStatus::Delayed
        );
        assert!(queue.dequeue("w", TTL).await.unwrap().is_none());

        let queue = InMemoryJobQueue::new();
        let id = queue.submit(entry(0)).await.unwrap();
        let delivery = queue.dequeue("w", TTL).await.unwrap().unwrap();
        queue.retry_later(&delivery.lease, Duration::ZERO).await.unwrap();
        let again = queue.dequeue("w", TTL).await.unwrap().unwrap();
        assert_eq!(again.entry.job_id, id);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn cancel_only_idle_jobs() {
        let queue = InMemoryJobQueue::new();
        let idle = queue.submit(entry(0)).await.unwrap();
        assert!(queue.cancel(idle).await.unwrap());
        assert!(!queue.cancel(idle).await.unwrap());

        let running = queue.submit(entry(0)).await.unwrap();
        queue.dequeue("w", TTL).await.unwrap().unwrap();
        assert!(!queue.cancel(running).await.unwrap());

        assert!(matches!(
            queue.cancel(JobId::new()).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn force_fail_and_stats() {
        let queue = InMemoryJobQueue::new();
        let a = queue.submit(entry(0)).await.unwrap();
        queue.submit(entry(0)).await.unwrap();
        queue.dequeue("w", TTL).await.unwrap();

        assert!(queue.force_fail(a, "timeout").await.unwrap());
        assert!(!queue.force_fail(a, "timeout").await.unwrap());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn delayed_submission_waits() {
        let queue = InMemoryJobQueue::new();
        let job = Job::new(
            OwnerId::new(),
            JobPayload::new("src", serde_json::json!({})),
            JobOptions::default().with_delay(Duration::from_secs(600)),
            Utc::now(),
        );
        queue.submit(QueueEntry::for_job(&job)).await.unwrap();

        assert_eq!(queue.stats().await.unwrap().delayed, 1);
        assert!(queue.dequeue("w", TTL).await.unwrap().is_none());
    }
}
