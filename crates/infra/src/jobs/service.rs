//! Caller-facing job facade.
//!
//! The HTTP layer (out of this workspace) talks to `JobService` only. Each
//! call is short: submission persists and enqueues, it never waits on
//! processing.
//!
//! ```text
//! submit ──► validate ──► store.insert ──► queue.submit ──► JobId
//! status ──► store.get
//! cancel ──► store.request_cancel ──► queue.cancel (idle jobs only)
//! retry  ──► store.get (failed | cancelled) ──► submit(same payload)
//! ```

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use civic_core::{DomainError, JobId, OwnerId};
use civic_pipeline::{CancelOutcome, Job, JobOptions, JobPayload, JobStatus};

use super::queue::{JobQueue, QueueEntry, QueueError, QueueStats};
use super::store::{JobStatusStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Rejected at submission; nothing was stored or queued.
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Submit / status / list / cancel / retry over a queue and a status store.
#[derive(Clone)]
pub struct JobService {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStatusStore>,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService").finish_non_exhaustive()
    }
}

impl JobService {
    pub fn new(queue: Arc<dyn JobQueue>, store: Arc<dyn JobStatusStore>) -> Self {
        Self { queue, store }
    }

    /// Validate, record and enqueue a new job.
    pub async fn submit(
        &self,
        owner_id: OwnerId,
        payload: JobPayload,
        options: JobOptions,
    ) -> Result<JobId, ServiceError> {
        payload.validate()?;
        if options.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1").into());
        }

        let job = Job::new(owner_id, payload, options, Utc::now());
        self.store.insert(&job).await?;

        if let Err(err) = self.queue.submit(QueueEntry::for_job(&job)).await {
            error!(job_id = %job.id, error = %err, "enqueue failed after status record was written");
            // Leave an explained terminal record rather than a job nobody will run.
            if let Err(store_err) = self.store.fail(job.id, &format!("enqueue failed: {err}")).await {
                error!(job_id = %job.id, error = %store_err, "failed to record enqueue failure");
            }
            return Err(err.into());
        }

        info!(
            job_id = %job.id,
            owner = %owner_id,
            status = %job.status,
            priority = job.options.priority,
            "job submitted"
        );
        Ok(job.id)
    }

    pub async fn status(&self, id: JobId) -> Result<Job, ServiceError> {
        self.store.get(id).await?.ok_or(ServiceError::NotFound(id))
    }

    /// The owner's jobs, newest first.
    pub async fn list_jobs(&self, owner_id: OwnerId) -> Result<Vec<Job>, ServiceError> {
        Ok(self.store.list_by_owner(owner_id).await?)
    }

    /// `true` when the job was cancelled or flagged for cancellation.
    ///
    /// Idle jobs are cancelled on the spot; running jobs stop at the next step
    /// boundary.
    pub async fn cancel(&self, id: JobId) -> Result<bool, ServiceError> {
        let outcome = match self.store.request_cancel(id).await {
            Ok(outcome) => outcome,
            Err(StoreError::NotFound(id)) => return Err(ServiceError::NotFound(id)),
            Err(err) => return Err(err.into()),
        };

        match outcome {
            CancelOutcome::Cancelled => {
                match self.queue.cancel(id).await {
                    Ok(_) | Err(QueueError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
                info!(job_id = %id, "job cancelled");
                Ok(true)
            }
            CancelOutcome::Requested => {
                info!(job_id = %id, "cancellation requested for running job");
                Ok(true)
            }
            CancelOutcome::Unchanged => Ok(false),
        }
    }

    /// Resubmit a failed or cancelled job as a new job.
    ///
    /// Returns `None` when the job is in any other state.
    pub async fn retry(&self, id: JobId) -> Result<Option<JobId>, ServiceError> {
        let job = self.status(id).await?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Ok(None);
        }

        let retried = self.submit(job.owner_id, job.payload, job.options).await?;
        info!(job_id = %id, retry_job_id = %retried, "job resubmitted");
        Ok(Some(retried))
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, ServiceError> {
        Ok(self.queue.stats().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::InMemoryJobQueue;
    use crate::jobs::store::InMemoryJobStatusStore;
    use std::time::Duration;

    fn service() -> (JobService, Arc<InMemoryJobQueue>, Arc<InMemoryJobStatusStore>) {
        let queue = InMemoryJobQueue::arc();
        let store = InMemoryJobStatusStore::arc();
        (JobService::new(queue.clone(), store.clone()), queue, store)
    }

    fn payload() -> JobPayload {
        JobPayload::new("file:///audio/meeting.mp3", serde_json::json!({"language": "de"}))
    }

    #[tokio::test]
    async fn submit_records_and_enqueues() {
        let (service, queue, _) = service();
        let owner = OwnerId::new();

        let id = service
            .submit(owner, payload(), JobOptions::default())
            .await
            .unwrap();

        let job = service.status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.progress, 0);
        assert_eq!(job.owner_id, owner);
        assert_eq!(
            queue.state(id).await.unwrap().unwrap().status,
            JobStatus::Waiting
        );
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_before_storage() {
        let (service, queue, store) = service();

        let err = service
            .submit(
                OwnerId::new(),
                JobPayload::new("", serde_json::json!({})),
                JobOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(store.is_empty());
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn list_jobs_is_scoped_to_owner() {
        let (service, _, _) = service();
        let alice = OwnerId::new();
        let bob = OwnerId::new();

        let first = service.submit(alice, payload(), JobOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = service.submit(alice, payload(), JobOptions::default()).await.unwrap();
        service.submit(bob, payload(), JobOptions::default()).await.unwrap();

        let jobs = service.list_jobs(alice).await.unwrap();
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![second, first]);
    }

    #[tokio::test]
    async fn cancel_waiting_job_cancels_queue_entry() {
        let (service, queue, _) = service();
        let id = service
            .submit(OwnerId::new(), payload(), JobOptions::default())
            .await
            .unwrap();

        assert!(service.cancel(id).await.unwrap());
        assert_eq!(service.status(id).await.unwrap().status, JobStatus::Cancelled);
        assert_eq!(
            queue.state(id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
        assert!(!service.cancel(id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_active_job_only_flags_it() {
        let (service, queue, store) = service();
        let id = service
            .submit(OwnerId::new(), payload(), JobOptions::default())
            .await
            .unwrap();
        queue.dequeue("w", Duration::from_secs(30)).await.unwrap();
        store.mark_active(id, 1).await.unwrap();

        assert!(service.cancel(id).await.unwrap());
        let job = service.status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert!(job.cancel_requested);
        assert_eq!(
            queue.state(id).await.unwrap().unwrap().status,
            JobStatus::Active
        );
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (service, _, _) = service();
        let id = JobId::new();
        assert!(matches!(
            service.status(id).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            service.cancel(id).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn retry_only_applies_to_failed_or_cancelled() {
        let (service, _, store) = service();
        let owner = OwnerId::new();
        let id = service.submit(owner, payload(), JobOptions::default()).await.unwrap();

        assert_eq!(service.retry(id).await.unwrap(), None);

        store.fail(id, "processing failed: model crashed").await.unwrap();
        let retried = service.retry(id).await.unwrap().unwrap();
        assert_ne!(retried, id);

        let job = service.status(retried).await.unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.payload, payload());
        assert_eq!(job.owner_id, owner);
    }
}
