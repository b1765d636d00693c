//! Progress tracker: applies step events to a job's snapshot and mirrors it
//! into the status store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use civic_core::JobId;
use civic_pipeline::{
    DetailedProgress, ProgressError, ProgressEvent, StepDetails, StepPlan, apply_update,
};

use super::store::JobStatusStore;

/// Minimum spacing between two `update_step` publishes that do not move the
/// global percentage.
const UPDATE_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Single-writer progress tracker for one running job.
///
/// Owned by the worker task that leased the job. Invalid events (unknown
/// step, out-of-order start) are dropped with a log line; they never abort the
/// job. Store failures are logged and retried implicitly by the next publish.
pub struct ProgressTracker {
    job_id: JobId,
    snapshot: DetailedProgress,
    store: Arc<dyn JobStatusStore>,
    last_publish: Option<Instant>,
    published_progress: Option<u8>,
}

impl ProgressTracker {
    pub fn new(job_id: JobId, plan: &StepPlan, store: Arc<dyn JobStatusStore>) -> Self {
        Self {
            job_id,
            snapshot: DetailedProgress::new(plan, Utc::now()),
            store,
            last_publish: None,
            published_progress: None,
        }
    }

    pub fn snapshot(&self) -> &DetailedProgress {
        &self.snapshot
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn start_step(
        &mut self,
        name: &str,
        message: impl Into<String>,
        details: Option<StepDetails>,
    ) {
        let event = ProgressEvent::StartStep {
            name: name.to_string(),
            message: message.into(),
            details,
        };
        self.apply(event, true).await;
    }

    pub async fn update_step(
        &mut self,
        name: &str,
        progress: u8,
        message: Option<String>,
        details: Option<StepDetails>,
    ) {
        let event = ProgressEvent::UpdateStep {
            name: name.to_string(),
            progress,
            message,
            details,
        };
        self.apply(event, false).await;
    }

    pub async fn complete_step(&mut self, name: &str, details: Option<StepDetails>) {
        let event = ProgressEvent::CompleteStep {
            name: name.to_string(),
            details,
        };
        self.apply(event, true).await;
    }

    pub async fn fail_step(&mut self, name: &str, error: impl Into<String>) {
        let event = ProgressEvent::FailStep {
            name: name.to_string(),
            error: error.into(),
        };
        self.apply(event, true).await;
    }

    async fn apply(&mut self, event: ProgressEvent, always_publish: bool) {
        match apply_update(&self.snapshot, &event, Utc::now()) {
            Ok(next) => self.snapshot = next,
            Err(ProgressError::UnknownStep(step)) => {
                debug!(job_id = %self.job_id, step = %step, "ignoring progress for unknown step");
                return;
            }
            Err(err) => {
                warn!(job_id = %self.job_id, error = %err, "progress event rejected");
                return;
            }
        }

        if always_publish || self.due_for_publish() {
            self.publish().await;
        }
    }

    fn due_for_publish(&self) -> bool {
        if self.published_progress != Some(self.snapshot.global_progress) {
            return true;
        }
        self.last_publish
            .is_none_or(|at| at.elapsed() >= UPDATE_PUBLISH_INTERVAL)
    }

    async fn publish(&mut self) {
        match self.store.publish_progress(self.job_id, &self.snapshot).await {
            Ok(_) => {
                self.last_publish = Some(Instant::now());
                self.published_progress = Some(self.snapshot.global_progress);
            }
            Err(err) => {
                warn!(job_id = %self.job_id, error = %err, "failed to publish progress");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStatusStore;
    use civic_core::OwnerId;
    use civic_pipeline::{Job, JobOptions, JobPayload, StepStatus};

    async fn active_job(store: &InMemoryJobStatusStore) -> JobId {
        let job = Job::new(
            OwnerId::new(),
            JobPayload::new("file:///tmp/a.mp3", serde_json::json!({})),
            JobOptions::default(),
            Utc::now(),
        );
        store.insert(&job).await.unwrap();
        store.mark_active(job.id, 1).await.unwrap();
        job.id
    }

    #[tokio::test]
    async fn publishes_global_progress_to_store() {
        let store = InMemoryJobStatusStore::arc();
        let id = active_job(&store).await;
        let plan = StepPlan::media_default();
        let mut tracker = ProgressTracker::new(id, &plan, store.clone());

        tracker.start_step("download", "Downloading", None).await;
        tracker.complete_step("download", None).await;
        tracker.start_step("process", "Processing", None).await;
        tracker.update_step("process", 50, Some("Halfway".to_string()), None).await;

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 55);
        assert_eq!(stored.progress_message, "Halfway");
        let detailed = stored.detailed_progress.unwrap();
        assert_eq!(detailed.current_step.as_deref(), Some("process"));
        assert_eq!(detailed.step("download").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_and_out_of_order_events_are_dropped() {
        let store = InMemoryJobStatusStore::arc();
        let id = active_job(&store).await;
        let plan = StepPlan::media_default();
        let mut tracker = ProgressTracker::new(id, &plan, store.clone());

        tracker.update_step("transcode", 40, None, None).await;
        tracker.start_step("persist", "Saving", None).await;

        assert_eq!(tracker.snapshot().global_progress, 0);
        assert!(tracker.snapshot().active_step().is_none());
    }

    #[tokio::test]
    async fn failure_keeps_global_progress() {
        let store = InMemoryJobStatusStore::arc();
        let id = active_job(&store).await;
        let plan = StepPlan::media_default();
        let mut tracker = ProgressTracker::new(id, &plan, store.clone());

        tracker.start_step("download", "Downloading", None).await;
        tracker.update_step("download", 50, None, None).await;
        tracker.fail_step("download", "404").await;

        assert_eq!(tracker.snapshot().global_progress, 10);
        let step = tracker.snapshot().step("download").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(store.get(id).await.unwrap().unwrap().progress, 10);
    }
}
