//! Job worker: leases jobs from the queue and runs their pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use civic_core::JobId;
use civic_pipeline::{JobOutcome, JobStatus, StepDetails, StepError, detail_keys};

use super::limiter::RateLimiter;
use super::queue::{Delivery, JobQueue, Lease, QueueError};
use super::steps::{JobContext, Pipeline, StepRun};
use super::store::{JobStatusStore, StoreError};
use super::tracker::ProgressTracker;

/// Max job starts per rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max: 2,
            window: Duration::from_secs(60),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging and lease ownership
    pub name: String,
    /// Jobs processed in parallel
    pub concurrency: usize,
    /// `None` disables start limiting
    pub rate_limit: Option<RateLimit>,
    /// Lease length; renewed every third of it while a job runs
    pub lease_ttl: Duration,
    /// How long to wait for new work before polling again
    pub poll_interval: Duration,
    /// Hard limit on a single step
    pub step_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "civic-worker".to_string(),
            concurrency: 1,
            rate_limit: Some(RateLimit::default()),
            lease_ttl: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            step_timeout: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_rate_limit(mut self, max: u32, window: Duration) -> Self {
        self.rate_limit = Some(RateLimit { max, window });
        self
    }

    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit = None;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }
}

/// How one delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReport {
    Completed,
    /// Terminal failure with the recorded error.
    Failed(String),
    /// Step failed with attempts left; the queue re-admits it after `delay`.
    Retrying { delay: Duration },
    Cancelled,
    /// The lease was lost mid-run; another delivery owns the job now.
    Abandoned,
    /// The status record was already terminal; the queue was acknowledged.
    Skipped,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_cancelled: u64,
    pub jobs_abandoned: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
    worker: Worker,
}

impl WorkerHandle {
    /// Stop taking new jobs and wait for in-flight ones to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "worker loop panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.worker.stats()
    }
}

/// How the step loop ended.
enum RunOutcome {
    Done(JobOutcome),
    Failed { step: String, error: StepError },
    Cancelled,
    LeaseLost,
}

struct WorkerInner {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStatusStore>,
    pipeline: Pipeline,
    config: WorkerConfig,
    stats: Mutex<WorkerStats>,
    started: Instant,
}

/// Background job worker.
///
/// Pulls deliveries from a [`JobQueue`], runs every step of its [`Pipeline`]
/// in order and finalises both the queue and the status store. Concurrency
/// is bounded by a semaphore and job starts by a sliding-window limiter.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.inner.config)
            .field("pipeline", &self.inner.pipeline)
            .finish()
    }
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn JobStatusStore>,
        pipeline: Pipeline,
        config: WorkerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                queue,
                store,
                pipeline,
                config,
                stats: Mutex::new(WorkerStats::default()),
                started: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self
            .inner
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.uptime_secs = self.inner.started.elapsed().as_secs();
        stats
    }

    /// Spawn the polling loop on the current tokio runtime.
    pub fn spawn(&self) -> WorkerHandle {
        let shutdown = Arc::new(Notify::new());
        let worker = self.clone();
        let signal = shutdown.clone();
        let join = tokio::spawn(async move { worker.run(signal).await });

        WorkerHandle {
            shutdown,
            join: Some(join),
            worker: self.clone(),
        }
    }

    /// Lease and run a single job, ignoring the rate limiter.
    pub async fn process_next(&self) -> Result<Option<JobReport>, QueueError> {
        let config = &self.inner.config;
        match self.inner.queue.dequeue(&config.name, config.lease_ttl).await? {
            Some(delivery) => Ok(Some(self.process(delivery).await)),
            None => Ok(None),
        }
    }

    /// Run one delivery to the end and record its outcome.
    pub async fn process(&self, delivery: Delivery) -> JobReport {
        self.update_stats(|s| s.current_running += 1);
        let report = self.execute(delivery).await;
        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match &report {
                JobReport::Completed => s.jobs_succeeded += 1,
                JobReport::Failed(_) => s.jobs_failed += 1,
                JobReport::Retrying { .. } => s.jobs_retried += 1,
                JobReport::Cancelled => s.jobs_cancelled += 1,
                JobReport::Abandoned => s.jobs_abandoned += 1,
                JobReport::Skipped => {}
            }
        });
        report
    }

    fn update_stats(&self, apply: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut stats) = self.inner.stats.lock() {
            apply(&mut stats);
        }
    }

    async fn run(self, shutdown: Arc<Notify>) {
        let config = self.inner.config.clone();
        info!(
            worker = %config.name,
            concurrency = config.concurrency,
            "job worker started"
        );

        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let mut limiter = config
            .rate_limit
            .map(|limit| RateLimiter::new(limit.max, limit.window));
        let mut in_flight = JoinSet::new();

        let stop = shutdown.notified();
        tokio::pin!(stop);

        loop {
            while let Some(result) = in_flight.try_join_next() {
                if let Err(err) = result {
                    error!(worker = %config.name, error = %err, "job task panicked");
                }
            }

            let permit = tokio::select! {
                _ = &mut stop => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if let Some(wait) = limiter.as_mut().and_then(|l| l.check(Instant::now())) {
                drop(permit);
                debug!(worker = %config.name, wait_ms = wait.as_millis() as u64, "rate limited");
                tokio::select! {
                    _ = &mut stop => break,
                    _ = tokio::time::sleep(wait) => continue,
                }
            }

            match self.inner.queue.dequeue(&config.name, config.lease_ttl).await {
                Ok(Some(delivery)) => {
                    if let Some(limiter) = limiter.as_mut() {
                        limiter.record(Instant::now());
                    }
                    let worker = self.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        worker.process(delivery).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = &mut stop => break,
                        _ = self.inner.queue.wait_for_work(config.poll_interval) => {}
                    }
                }
                Err(err) => {
                    drop(permit);
                    error!(worker = %config.name, error = %err, "failed to dequeue job");
                    tokio::select! {
                        _ = &mut stop => break,
                        _ = tokio::time::sleep(config.poll_interval) => {}
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(worker = %config.name, in_flight = in_flight.len(), "waiting for in-flight jobs");
        }
        while let Some(result) = in_flight.join_next().await {
            if let Err(err) = result {
                error!(worker = %config.name, error = %err, "job task panicked");
            }
        }

        info!(worker = %config.name, "job worker stopped");
    }

    async fn execute(&self, delivery: Delivery) -> JobReport {
        let id = delivery.entry.job_id;
        let store = &self.inner.store;

        match store.mark_active(id, delivery.attempt).await {
            Ok(Some(_)) => {}
            Ok(None) => return self.settle_stale(&delivery).await,
            Err(StoreError::NotFound(_)) => {
                let message = "status record missing".to_string();
                warn!(job_id = %id, "queued job has no status record");
                self.ack_fail(&delivery.lease, &message).await;
                return JobReport::Failed(message);
            }
            Err(err) => {
                // The lease will lapse and the job is redelivered.
                error!(job_id = %id, error = %err, "failed to mark job active");
                return JobReport::Abandoned;
            }
        }

        info!(
            job_id = %id,
            owner = %delivery.entry.owner_id,
            attempt = delivery.attempt,
            "job started"
        );

        let lease_lost = Arc::new(AtomicBool::new(false));
        let heartbeat = self.spawn_heartbeat(delivery.lease.clone(), lease_lost.clone());
        let outcome = self.run_steps(&delivery, &lease_lost).await;
        heartbeat.abort();

        self.finalize(&delivery, outcome).await
    }

    fn spawn_heartbeat(&self, lease: Lease, lost: Arc<AtomicBool>) -> JoinHandle<()> {
        let queue = self.inner.queue.clone();
        let ttl = self.inner.config.lease_ttl;
        let every = (ttl / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut lease = lease;
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match queue.extend_lease(&lease, ttl).await {
                    Ok(extended) => lease = extended,
                    Err(QueueError::LeaseLost(_) | QueueError::NotFound(_)) => {
                        warn!(job_id = %lease.job_id, "lease lost");
                        lost.store(true, Ordering::Release);
                        break;
                    }
                    Err(err) => {
                        warn!(job_id = %lease.job_id, error = %err, "failed to extend lease");
                    }
                }
            }
        })
    }

    async fn cancel_requested(&self, id: JobId) -> bool {
        match self.inner.store.get(id).await {
            Ok(Some(job)) => job.cancel_requested || job.status == JobStatus::Cancelled,
            Ok(None) => false,
            Err(err) => {
                warn!(job_id = %id, error = %err, "failed to check for cancellation");
                false
            }
        }
    }

    async fn run_steps(&self, delivery: &Delivery, lease_lost: &AtomicBool) -> RunOutcome {
        let mut ctx = JobContext::from_delivery(delivery);
        let outcome = self.drive_steps(&mut ctx, lease_lost).await;
        self.inner.pipeline.cleanup(&ctx).await;
        outcome
    }

    async fn drive_steps(&self, ctx: &mut JobContext, lease_lost: &AtomicBool) -> RunOutcome {
        let id = ctx.job_id;
        let pipeline = &self.inner.pipeline;
        let step_timeout = self.inner.config.step_timeout;

        let mut tracker = ProgressTracker::new(id, pipeline.plan(), self.inner.store.clone());

        for (descriptor, handler) in pipeline.steps() {
            if lease_lost.load(Ordering::Acquire) {
                return RunOutcome::LeaseLost;
            }
            if self.cancel_requested(id).await {
                return RunOutcome::Cancelled;
            }

            let mut start = StepDetails::new();
            start.insert(detail_keys::ATTEMPT.to_string(), ctx.attempt.into());
            tracker
                .start_step(&descriptor.name, descriptor.label.clone(), Some(start))
                .await;
            debug!(job_id = %id, step = %descriptor.name, "step started");

            let result = {
                let mut run = StepRun::new(ctx, &mut tracker, &descriptor.name);
                match step_timeout {
                    Some(limit) => tokio::time::timeout(limit, handler.run(&mut run))
                        .await
                        .unwrap_or(Err(StepError::Timeout(limit))),
                    None => handler.run(&mut run).await,
                }
            };

            match result {
                Ok(details) => {
                    tracker.complete_step(&descriptor.name, Some(details)).await;
                }
                Err(error) => {
                    tracker.fail_step(&descriptor.name, error.to_string()).await;
                    return RunOutcome::Failed {
                        step: descriptor.name.clone(),
                        error,
                    };
                }
            }
        }

        match ctx.outcome() {
            Ok(outcome) => RunOutcome::Done(outcome),
            Err(error) => RunOutcome::Failed {
                step: "finalize".to_string(),
                error,
            },
        }
    }

    async fn finalize(&self, delivery: &Delivery, outcome: RunOutcome) -> JobReport {
        let id = delivery.entry.job_id;
        let lease = &delivery.lease;
        let queue = &self.inner.queue;
        let store = &self.inner.store;

        match outcome {
            RunOutcome::Done(result) => {
                match queue.complete(lease, &result).await {
                    Ok(()) => {}
                    Err(QueueError::LeaseLost(_)) => {
                        warn!(job_id = %id, "lease lost before completion");
                        return JobReport::Abandoned;
                    }
                    Err(err) => {
                        error!(job_id = %id, error = %err, "failed to complete job in queue");
                    }
                }
                if let Err(err) = store.complete(id, &result).await {
                    error!(job_id = %id, error = %err, "failed to record job completion");
                }
                info!(job_id = %id, record_id = %result.record_id, "job completed");
                JobReport::Completed
            }
            RunOutcome::Failed { step, error } => {
                let message = error.to_string();
                let options = &delivery.entry.options;

                if options.should_retry(delivery.attempt) {
                    let delay = options.backoff.delay_for_attempt(delivery.attempt);
                    match queue.retry_later(lease, delay).await {
                        Ok(()) => {
                            if let Err(err) = store.mark_delayed(id, &message).await {
                                error!(job_id = %id, error = %err, "failed to record retry");
                            }
                            info!(
                                job_id = %id,
                                step = %step,
                                attempt = delivery.attempt,
                                delay_ms = delay.as_millis() as u64,
                                "step failed, retry scheduled"
                            );
                            return JobReport::Retrying { delay };
                        }
                        Err(QueueError::LeaseLost(_)) => return JobReport::Abandoned,
                        Err(err) => {
                            error!(job_id = %id, error = %err, "failed to schedule retry");
                        }
                    }
                }

                if !self.ack_fail(lease, &message).await {
                    return JobReport::Abandoned;
                }
                if let Err(err) = store.fail(id, &message).await {
                    error!(job_id = %id, error = %err, "failed to record job failure");
                }
                warn!(job_id = %id, step = %step, error = %message, "job failed");
                JobReport::Failed(message)
            }
            RunOutcome::Cancelled => {
                if !self.ack_fail(lease, "cancelled").await {
                    return JobReport::Abandoned;
                }
                if let Err(err) = store.mark_cancelled(id).await {
                    error!(job_id = %id, error = %err, "failed to record cancellation");
                }
                info!(job_id = %id, "job cancelled");
                JobReport::Cancelled
            }
            RunOutcome::LeaseLost => {
                warn!(job_id = %id, "abandoning job after losing its lease");
                JobReport::Abandoned
            }
        }
    }

    /// `queue.fail`; returns `false` only when the lease was lost.
    async fn ack_fail(&self, lease: &Lease, message: &str) -> bool {
        match self.inner.queue.fail(lease, message).await {
            Ok(()) => true,
            Err(QueueError::LeaseLost(_)) => {
                warn!(job_id = %lease.job_id, "lease lost before failure was recorded");
                false
            }
            Err(err) => {
                error!(job_id = %lease.job_id, error = %err, "failed to fail job in queue");
                true
            }
        }
    }

    /// The status record refused the delivery: it is already terminal or a
    /// newer delivery owns it. Bring the queue in line with the record.
    async fn settle_stale(&self, delivery: &Delivery) -> JobReport {
        let id = delivery.entry.job_id;
        let lease = &delivery.lease;

        let job = match self.inner.store.get(id).await {
            Ok(Some(job)) => job,
            Ok(None) => return JobReport::Skipped,
            Err(err) => {
                error!(job_id = %id, error = %err, "failed to load status record");
                return JobReport::Abandoned;
            }
        };

        let acked = match job.status {
            JobStatus::Completed => match &job.result {
                Some(result) => self.inner.queue.complete(lease, result).await,
                None => self.inner.queue.fail(lease, "completed without result").await,
            },
            JobStatus::Failed => {
                let error = job.error.as_deref().unwrap_or("failed");
                self.inner.queue.fail(lease, error).await
            }
            JobStatus::Cancelled => self.inner.queue.fail(lease, "cancelled").await,
            _ => {
                debug!(job_id = %id, attempt = delivery.attempt, "stale delivery ignored");
                return JobReport::Skipped;
            }
        };

        if let Err(err) = acked {
            warn!(job_id = %id, error = %err, "failed to acknowledge finished job");
        }
        debug!(job_id = %id, status = %job.status, "delivery for finished job acknowledged");
        JobReport::Skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use chrono::Utc;
    use civic_core::OwnerId;
    use civic_pipeline::{
        Downloader, FetchedArtifact, Job, JobOptions, JobPayload, Persister, ProcessedOutput,
        Processor, ProgressReporter, RetryPolicy,
    };

    use crate::jobs::queue::{InMemoryJobQueue, QueueEntry};
    use crate::jobs::store::InMemoryJobStatusStore;

    struct Fetch;

    #[async_trait]
    impl Downloader for Fetch {
        async fn fetch(&self, source: &str) -> Result<FetchedArtifact, StepError> {
            if source.contains("missing") {
                return Err(StepError::Download("404 not found".to_string()));
            }
            Ok(FetchedArtifact {
                path: PathBuf::from("/tmp/a"),
                metadata: serde_json::json!({"file_size": 10}),
            })
        }
    }

    struct Process {
        delay: Duration,
    }

    #[async_trait]
    impl Processor for Process {
        async fn run(
            &self,
            _artifact: &Path,
            _params: &serde_json::Value,
            progress: ProgressReporter,
        ) -> Result<ProcessedOutput, StepError> {
            progress.report(50, None);
            tokio::time::sleep(self.delay).await;
            Ok(ProcessedOutput {
                result: serde_json::json!({"ok": true}),
                metadata: serde_json::json!({}),
            })
        }
    }

    #[derive(Default)]
    struct Save {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Persister for Save {
        async fn save(
            &self,
            _owner_id: OwnerId,
            _result: &serde_json::Value,
            _metadata: &serde_json::Value,
        ) -> Result<String, StepError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("rec-{n}"))
        }
    }

    struct Harness {
        queue: Arc<InMemoryJobQueue>,
        store: Arc<InMemoryJobStatusStore>,
        worker: Worker,
    }

    fn harness(config: WorkerConfig, process_delay: Duration) -> Harness {
        let queue = InMemoryJobQueue::arc();
        let store = InMemoryJobStatusStore::arc();
        let pipeline = Pipeline::media(
            Arc::new(Fetch),
            Arc::new(Process {
                delay: process_delay,
            }),
            Arc::new(Save::default()),
        );
        let worker = Worker::new(queue.clone(), store.clone(), pipeline, config);
        Harness {
            queue,
            store,
            worker,
        }
    }

    async fn submit(h: &Harness, source: &str, options: JobOptions) -> JobId {
        let job = Job::new(
            OwnerId::new(),
            JobPayload::new(source, serde_json::json!({})),
            options,
            Utc::now(),
        );
        h.store.insert(&job).await.unwrap();
        h.queue.submit(QueueEntry::for_job(&job)).await.unwrap()
    }

    #[tokio::test]
    async fn completes_job_and_acks_queue() {
        let h = harness(WorkerConfig::default(), Duration::ZERO);
        let id = submit(&h, "file:///in.wav", JobOptions::default()).await;

        let report = h.worker.process_next().await.unwrap().unwrap();
        assert_eq!(report, JobReport::Completed);

        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result.unwrap().record_id, "rec-0");
        assert_eq!(
            h.queue.state(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
        assert_eq!(h.worker.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn step_failure_is_terminal_without_budget() {
        let h = harness(WorkerConfig::default(), Duration::ZERO);
        let id = submit(&h, "file:///missing.wav", JobOptions::default()).await;

        let report = h.worker.process_next().await.unwrap().unwrap();
        assert!(matches!(report, JobReport::Failed(ref e) if e.contains("404")));

        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
        let detailed = job.detailed_progress.unwrap();
        assert_eq!(
            detailed.step("download").unwrap().status,
            civic_pipeline::StepStatus::Failed
        );
        assert_eq!(
            detailed.step("process").unwrap().status,
            civic_pipeline::StepStatus::Pending
        );
        assert_eq!(
            h.queue.state(id).await.unwrap().unwrap().error.as_deref(),
            Some("download failed: 404 not found")
        );
    }

    #[tokio::test]
    async fn step_failure_with_budget_is_retried() {
        let h = harness(WorkerConfig::default(), Duration::ZERO);
        let options =
            JobOptions::default().with_attempts(2, RetryPolicy::fixed(Duration::from_millis(1)));
        let id = submit(&h, "file:///missing.wav", options).await;

        let first = h.worker.process_next().await.unwrap().unwrap();
        assert!(matches!(first, JobReport::Retrying { .. }));
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.progress, 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = h.worker.process_next().await.unwrap().unwrap();
        assert!(matches!(second, JobReport::Failed(_)));
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 2);
    }

    #[tokio::test]
    async fn step_timeout_fails_the_job() {
        let config = WorkerConfig::default().with_step_timeout(Duration::from_millis(20));
        let h = harness(config, Duration::from_secs(5));
        let id = submit(&h, "file:///slow.wav", JobOptions::default()).await;

        let report = h.worker.process_next().await.unwrap().unwrap();
        assert!(matches!(report, JobReport::Failed(ref e) if e.contains("timed out")));
        assert_eq!(
            h.store.get(id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn delivery_for_cancelled_job_is_skipped() {
        let h = harness(WorkerConfig::default(), Duration::ZERO);
        let id = submit(&h, "file:///in.wav", JobOptions::default()).await;
        // Status store cancelled, queue not yet told.
        h.store.mark_cancelled(id).await.unwrap();

        let report = h.worker.process_next().await.unwrap().unwrap();
        assert_eq!(report, JobReport::Skipped);
        let state = h.queue.state(id).await.unwrap().unwrap();
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn spawned_worker_drains_queue_and_shuts_down() {
        let config = WorkerConfig::default()
            .with_concurrency(2)
            .without_rate_limit()
            .with_poll_interval(Duration::from_millis(10));
        let h = harness(config, Duration::from_millis(5));

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(submit(&h, "file:///in.wav", JobOptions::default()).await);
        }

        let handle = h.worker.spawn();
        for _ in 0..200 {
            if h.queue.stats().await.unwrap().completed == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        for id in ids {
            assert_eq!(
                h.store.get(id).await.unwrap().unwrap().status,
                JobStatus::Completed
            );
        }
        assert_eq!(h.worker.stats().jobs_succeeded, 4);
    }

    #[tokio::test]
    async fn rate_limiter_holds_back_extra_starts() {
        let config = WorkerConfig::default()
            .with_rate_limit(1, Duration::from_secs(60))
            .with_poll_interval(Duration::from_millis(10));
        let h = harness(config, Duration::ZERO);
        submit(&h, "file:///a.wav", JobOptions::default()).await;
        submit(&h, "file:///b.wav", JobOptions::default()).await;

        let handle = h.worker.spawn();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown().await;

        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.waiting, 1);
    }
}
