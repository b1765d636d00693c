//! Recovery service: reconciles the status store with the queue after crashes
//! and enforces the job timeout and retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use civic_pipeline::{Job, JobStatus};

use super::queue::{JobQueue, QueueState};
use super::store::JobStatusStore;

/// Error recorded for jobs whose queue entry vanished.
pub const INTERRUPTED_ERROR: &str = "Process interrupted (restart)";

/// Recovery configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Time between two periodic passes
    pub interval: Duration,
    /// Unfinished jobs eligible to run for longer than this are failed
    pub job_timeout: Duration,
    /// A record touched this recently is never treated as orphaned; covers
    /// the gap between the status insert and the enqueue. Keep it at or
    /// above the worker lease TTL.
    pub orphan_grace: Duration,
    /// Finished jobs older than this are deleted
    pub retention: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            job_timeout: Duration::from_secs(3 * 60 * 60),
            orphan_grace: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl RecoveryConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Error recorded for jobs that exceeded `job_timeout`.
    pub fn timeout_message(&self) -> String {
        let secs = self.job_timeout.as_secs();
        match secs {
            3600 => "Timeout after 1 hour".to_string(),
            s if s % 3600 == 0 => format!("Timeout after {} hours", s / 3600),
            s => format!("Timeout after {} minutes", s.div_ceil(60)),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecoveryReport {
    /// Unfinished jobs the queue had no record of
    pub orphaned: usize,
    /// Terminal queue states copied into a lagging status store
    pub propagated: usize,
    pub timed_out: usize,
    pub purged_records: usize,
    pub purged_queue_entries: usize,
    /// Jobs or purges that failed and will be retried next pass
    pub errors: usize,
}

impl RecoveryReport {
    pub fn is_noop(&self) -> bool {
        self.orphaned == 0
            && self.propagated == 0
            && self.timed_out == 0
            && self.purged_records == 0
            && self.purged_queue_entries == 0
    }
}

/// Handle to a spawned recovery loop.
#[derive(Debug)]
pub struct RecoveryHandle {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
}

impl RecoveryHandle {
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "recovery loop panicked");
            }
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

/// Reconciliation of status store and queue.
///
/// Every check is idempotent: a second pass over unchanged state does
/// nothing.
#[derive(Clone)]
pub struct RecoveryService {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStatusStore>,
    config: RecoveryConfig,
}

impl std::fmt::Debug for RecoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryService")
            .field("config", &self.config)
            .finish()
    }
}

impl RecoveryService {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn JobStatusStore>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            queue,
            store,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub async fn run_once(&self) -> RecoveryReport {
        self.run_at(Utc::now()).await
    }

    /// One pass as of `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        self.reconcile(now, &mut report).await;
        self.enforce_timeout(now, &mut report).await;
        self.purge(now, &mut report).await;

        if report.is_noop() && report.errors == 0 {
            debug!("recovery pass found nothing to do");
        } else {
            info!(
                orphaned = report.orphaned,
                propagated = report.propagated,
                timed_out = report.timed_out,
                purged_records = report.purged_records,
                purged_queue_entries = report.purged_queue_entries,
                errors = report.errors,
                "recovery pass finished"
            );
        }
        report
    }

    /// Run every `interval` until shut down. The first periodic pass comes
    /// one interval after the spawn; callers wanting a startup pass call
    /// [`RecoveryService::run_once`] themselves.
    pub fn spawn(&self) -> RecoveryHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let service = self.clone();

        let join = tokio::spawn(async move {
            info!(interval_secs = service.config.interval.as_secs(), "recovery service started");
            let period = service.config.interval;
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        service.run_once().await;
                    }
                }
            }
            info!("recovery service stopped");
        });

        RecoveryHandle {
            shutdown,
            join: Some(join),
        }
    }

    async fn unfinished(&self, report: &mut RecoveryReport) -> Vec<Job> {
        match self.store.list_unfinished().await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "failed to list unfinished jobs");
                report.errors += 1;
                Vec::new()
            }
        }
    }

    async fn reconcile(&self, now: DateTime<Utc>, report: &mut RecoveryReport) {
        let grace = to_chrono(self.config.orphan_grace);

        for job in self.unfinished(report).await {
            let state = match self.queue.state(job.id).await {
                Ok(state) => state,
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "failed to read queue state");
                    report.errors += 1;
                    continue;
                }
            };

            match state {
                None if now - job.updated_at < grace => {
                    debug!(job_id = %job.id, "queue entry missing inside grace window");
                }
                None => match self.store.fail(job.id, INTERRUPTED_ERROR).await {
                    Ok(Some(_)) => {
                        warn!(job_id = %job.id, status = %job.status, "orphaned job failed");
                        report.orphaned += 1;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!(job_id = %job.id, error = %err, "failed to fail orphaned job");
                        report.errors += 1;
                    }
                },
                Some(state) if state.status.is_terminal() => {
                    match self.propagate(&job, &state).await {
                        Ok(true) => {
                            info!(job_id = %job.id, status = %state.status, "queue state propagated");
                            report.propagated += 1;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            error!(job_id = %job.id, error = %err, "failed to propagate queue state");
                            report.errors += 1;
                        }
                    }
                }
                Some(_) => {}
            }
        }
    }

    async fn propagate(
        &self,
        job: &Job,
        state: &QueueState,
    ) -> Result<bool, super::store::StoreError> {
        let updated = match state.status {
            JobStatus::Completed => match &state.result {
                Some(result) => self.store.complete(job.id, result).await?,
                None => self.store.fail(job.id, "completed without result").await?,
            },
            JobStatus::Failed => {
                let error = state.error.as_deref().unwrap_or("failed");
                if error == "cancelled" {
                    self.store.mark_cancelled(job.id).await?
                } else {
                    self.store.fail(job.id, error).await?
                }
            }
            JobStatus::Cancelled => self.store.mark_cancelled(job.id).await?,
            _ => None,
        };
        Ok(updated.is_some())
    }

    async fn enforce_timeout(&self, now: DateTime<Utc>, report: &mut RecoveryReport) {
        let limit = to_chrono(self.config.job_timeout);
        let message = self.config.timeout_message();

        for job in self.unfinished(report).await {
            if job.age(now) <= limit {
                continue;
            }

            match self.store.fail(job.id, &message).await {
                Ok(Some(_)) => {
                    warn!(job_id = %job.id, status = %job.status, "job timed out");
                    report.timed_out += 1;
                }
                Ok(None) => continue,
                Err(err) => {
                    error!(job_id = %job.id, error = %err, "failed to time out job");
                    report.errors += 1;
                    continue;
                }
            }

            if let Err(err) = self.queue.force_fail(job.id, &message).await {
                warn!(job_id = %job.id, error = %err, "failed to fail timed-out job in queue");
                report.errors += 1;
            }
        }
    }

    async fn purge(&self, now: DateTime<Utc>, report: &mut RecoveryReport) {
        let cutoff = now - to_chrono(self.config.retention);

        match self.store.purge_finished_before(cutoff).await {
            Ok(n) => report.purged_records = n,
            Err(err) => {
                error!(error = %err, "failed to purge status records");
                report.errors += 1;
            }
        }
        match self.queue.purge_finished_before(cutoff).await {
            Ok(n) => report.purged_queue_entries = n,
            Err(err) => {
                error!(error = %err, "failed to purge queue entries");
                report.errors += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civic_core::OwnerId;
    use civic_pipeline::{JobOptions, JobOutcome, JobPayload};

    use crate::jobs::queue::{InMemoryJobQueue, QueueEntry};
    use crate::jobs::store::InMemoryJobStatusStore;

    fn service(
        queue: &Arc<InMemoryJobQueue>,
        store: &Arc<InMemoryJobStatusStore>,
    ) -> RecoveryService {
        RecoveryService::new(queue.clone(), store.clone(), RecoveryConfig::default())
    }

    async fn submit(
        queue: &InMemoryJobQueue,
        store: &InMemoryJobStatusStore,
        created_at: DateTime<Utc>,
    ) -> Job {
        let job = Job::new(
            OwnerId::new(),
            JobPayload::new("file:///x.wav", serde_json::json!({})),
            JobOptions::default(),
            created_at,
        );
        store.insert(&job).await.unwrap();
        queue.submit(QueueEntry::for_job(&job)).await.unwrap();
        job
    }

    #[test]
    fn timeout_messages() {
        let config = RecoveryConfig::default();
        assert_eq!(config.timeout_message(), "Timeout after 3 hours");
        assert_eq!(
            config
                .clone()
                .with_job_timeout(Duration::from_secs(3600))
                .timeout_message(),
            "Timeout after 1 hour"
        );
        assert_eq!(
            config
                .with_job_timeout(Duration::from_secs(90 * 60))
                .timeout_message(),
            "Timeout after 90 minutes"
        );
    }

    #[tokio::test]
    async fn orphaned_job_is_failed_once() {
        let queue = InMemoryJobQueue::arc();
        let store = InMemoryJobStatusStore::arc();
        let job = submit(&queue, &store, Utc::now()).await;
        store.mark_active(job.id, 1).await.unwrap();
        queue.remove(job.id);

        let recovery = service(&queue, &store);
        let later = Utc::now() + chrono::Duration::minutes(10);
        let first = recovery.run_at(later).await;
        assert_eq!(first.orphaned, 1);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some(INTERRUPTED_ERROR));

        let second = recovery.run_at(later).await;
        assert!(second.is_noop());
    }

    #[tokio::test]
    async fn recently_touched_record_without_queue_entry_is_not_orphaned() {
        let queue = InMemoryJobQueue::arc();
        let store = InMemoryJobStatusStore::arc();
        let job = Job::new(
            OwnerId::new(),
            JobPayload::new("file:///x.wav", serde_json::json!({})),
            JobOptions::default(),
            Utc::now(),
        );
        // Inserted but not yet enqueued.
        store.insert(&job).await.unwrap();

        let recovery = service(&queue, &store);
        let report = recovery.run_once().await;
        assert_eq!(report.orphaned, 0);
        assert!(report.is_noop());
        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Waiting
        );

        let past_grace = job.updated_at + chrono::Duration::minutes(6);
        assert_eq!(recovery.run_at(past_grace).await.orphaned, 1);
    }

    #[tokio::test]
    async fn live_queue_jobs_are_left_alone() {
        let queue = InMemoryJobQueue::arc();
        let store = InMemoryJobStatusStore::arc();
        let waiting = submit(&queue, &store, Utc::now()).await;

        let report = service(&queue, &store).run_once().await;
        assert!(report.is_noop());
        assert_eq!(
            store.get(waiting.id).await.unwrap().unwrap().status,
            JobStatus::Waiting
        );
    }

    #[tokio::test]
    async fn terminal_queue_states_propagate() {
        let queue = InMemoryJobQueue::arc();
        let store = InMemoryJobStatusStore::arc();

        let failed = submit(&queue, &store, Utc::now()).await;
        let delivery = queue.dequeue("w", Duration::from_secs(30)).await.unwrap().unwrap();
        store.mark_active(failed.id, 1).await.unwrap();
        queue.fail(&delivery.lease, "processing failed: oom").await.unwrap();

        let done = submit(&queue, &store, Utc::now()).await;
        let delivery = queue.dequeue("w", Duration::from_secs(30)).await.unwrap().unwrap();
        let outcome = JobOutcome {
            record_id: "rec-7".to_string(),
            summary: serde_json::Value::Null,
        };
        queue.complete(&delivery.lease, &outcome).await.unwrap();

        let recovery = service(&queue, &store);
        let report = recovery.run_once().await;
        assert_eq!(report.propagated, 2);

        let failed = store.get(failed.id).await.unwrap().unwrap();
        assert_eq!(failed.error.as_deref(), Some("processing failed: oom"));
        let done = store.get(done.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result, Some(outcome));

        assert!(recovery.run_once().await.is_noop());
    }

    #[tokio::test]
    async fn old_unfinished_jobs_time_out_in_both_places() {
        let queue = InMemoryJobQueue::arc();
        let store = InMemoryJobStatusStore::arc();
        let old = submit(&queue, &store, Utc::now() - chrono::Duration::hours(4)).await;
        queue.dequeue("w", Duration::from_secs(30)).await.unwrap();
        store.mark_active(old.id, 1).await.unwrap();
        let fresh = submit(&queue, &store, Utc::now()).await;

        let recovery = service(&queue, &store);
        let report = recovery.run_once().await;
        assert_eq!(report.timed_out, 1);

        let stored = store.get(old.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("Timeout after 3 hours"));
        assert_eq!(
            queue.state(old.id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
        assert_eq!(
            store.get(fresh.id).await.unwrap().unwrap().status,
            JobStatus::Waiting
        );

        assert!(recovery.run_once().await.is_noop());
    }

    #[tokio::test]
    async fn start_delay_does_not_count_toward_the_timeout() {
        let queue = InMemoryJobQueue::arc();
        let store = InMemoryJobStatusStore::arc();
        let job = Job::new(
            OwnerId::new(),
            JobPayload::new("file:///x.wav", serde_json::json!({})),
            JobOptions::default().with_delay(Duration::from_secs(5 * 3600)),
            Utc::now() - chrono::Duration::hours(4),
        );
        store.insert(&job).await.unwrap();
        queue.submit(QueueEntry::for_job(&job)).await.unwrap();

        let recovery = service(&queue, &store);
        assert!(recovery.run_once().await.is_noop());
        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Delayed
        );

        // Eligible one hour from now; times out three hours after that.
        let past_limit = Utc::now() + chrono::Duration::hours(4) + chrono::Duration::minutes(1);
        assert_eq!(recovery.run_at(past_limit).await.timed_out, 1);
    }

    #[tokio::test]
    async fn spawned_loop_waits_one_interval_before_its_first_pass() {
        let queue = InMemoryJobQueue::arc();
        let store = InMemoryJobStatusStore::arc();
        let job = submit(&queue, &store, Utc::now()).await;
        store.mark_active(job.id, 1).await.unwrap();
        queue.remove(job.id);

        let config = RecoveryConfig::default().with_orphan_grace(Duration::ZERO);
        let handle = RecoveryService::new(queue.clone(), store.clone(), config).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Active
        );
    }

    #[tokio::test]
    async fn retention_purges_old_finished_jobs() {
        let queue = InMemoryJobQueue::arc();
        let store = InMemoryJobStatusStore::arc();
        let now = Utc::now();

        let mut old = Job::new(
            OwnerId::new(),
            JobPayload::new("a", serde_json::json!({})),
            JobOptions::default(),
            now - chrono::Duration::days(41),
        );
        old.mark_completed(
            JobOutcome {
                record_id: "r1".to_string(),
                summary: serde_json::Value::Null,
            },
            now - chrono::Duration::days(40),
        );
        store.put(old.clone()).unwrap();

        let mut recent = old.clone();
        recent.id = civic_core::JobId::new();
        recent.completed_at = Some(now - chrono::Duration::days(10));
        store.put(recent.clone()).unwrap();

        let report = service(&queue, &store).run_at(now).await;
        assert_eq!(report.purged_records, 1);
        assert!(store.get(old.id).await.unwrap().is_none());
        assert!(store.get(recent.id).await.unwrap().is_some());
    }
}
