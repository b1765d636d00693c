//! Job status storage.
//!
//! The status store is what callers poll. It is independent of the queue
//! engine: the queue decides who runs a job, the store records what happened.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use civic_core::{JobId, OwnerId};
use civic_pipeline::{CancelOutcome, DetailedProgress, Job, JobOutcome, JobStatus};

/// Mutation applied to a stored record. Returns `true` when it changed the job.
pub type JobMutation<'a> = &'a (dyn Fn(&mut Job) -> bool + Send + Sync);

/// Status store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt record for job {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

/// Durable record of every job's lifecycle.
///
/// `update_with` is the single write primitive: the mutation runs against the
/// current record under the store's own isolation and is persisted only when
/// it reports a change. Every lifecycle helper is built on top of it so the
/// transition rules live in [`Job`] and nowhere else.
#[async_trait]
pub trait JobStatusStore: Send + Sync + 'static {
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Jobs of one owner, newest first.
    async fn list_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Job>, StoreError>;

    /// Jobs in `waiting`, `active` or `delayed`, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError>;

    /// Apply `mutation` atomically. `Ok(None)` means nothing changed.
    async fn update_with(
        &self,
        id: JobId,
        mutation: JobMutation<'_>,
    ) -> Result<Option<Job>, StoreError>;

    /// Hard-delete terminal jobs finished before `cutoff`.
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn mark_active(&self, id: JobId, attempt: u32) -> Result<Option<Job>, StoreError> {
        self.update_with(id, &move |job: &mut Job| job.mark_active(attempt, Utc::now()))
            .await
    }

    async fn publish_progress(
        &self,
        id: JobId,
        snapshot: &DetailedProgress,
    ) -> Result<Option<Job>, StoreError> {
        self.update_with(id, &|job: &mut Job| job.apply_progress(snapshot, Utc::now()))
            .await
    }

    async fn complete(&self, id: JobId, outcome: &JobOutcome) -> Result<Option<Job>, StoreError> {
        self.update_with(id, &|job: &mut Job| {
            job.mark_completed(outcome.clone(), Utc::now())
        })
        .await
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<Option<Job>, StoreError> {
        self.update_with(id, &|job: &mut Job| job.mark_failed(error, Utc::now()))
            .await
    }

    async fn mark_cancelled(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.update_with(id, &|job: &mut Job| job.mark_cancelled(Utc::now()))
            .await
    }

    async fn mark_delayed(&self, id: JobId, reason: &str) -> Result<Option<Job>, StoreError> {
        self.update_with(id, &|job: &mut Job| job.mark_delayed(reason, Utc::now()))
            .await
    }

    async fn request_cancel(&self, id: JobId) -> Result<CancelOutcome, StoreError> {
        let updated = self
            .update_with(id, &|job: &mut Job| {
                job.request_cancel(Utc::now()) != CancelOutcome::Unchanged
            })
            .await?;

        Ok(match updated {
            Some(job) if job.status == JobStatus::Cancelled => CancelOutcome::Cancelled,
            Some(_) => CancelOutcome::Requested,
            None => CancelOutcome::Unchanged,
        })
    }
}

/// In-memory status store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStatusStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite a record as-is. Tests use this to backdate jobs.
    pub fn put(&self, job: Job) -> Result<(), StoreError> {
        self.jobs.write().map_err(poisoned)?.insert(job.id, job);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Storage("status store lock poisoned".to_string())
}

#[async_trait]
impl JobStatusStore for InMemoryJobStatusStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&id).cloned())
    }

    async fn list_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.owner_id == owner_id)
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(result)
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs.values().filter(|j| !j.is_terminal()).cloned().collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }

    async fn update_with(
        &self,
        id: JobId,
        mutation: JobMutation<'_>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let stored = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let mut candidate = stored.clone();
        if !mutation(&mut candidate) {
            return Ok(None);
        }
        *stored = candidate.clone();
        Ok(Some(candidate))
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok(before - jobs.len())
    }
}
