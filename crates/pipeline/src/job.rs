//! Job status record, options and lifecycle transitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use civic_core::{DomainError, DomainResult, JobId, OwnerId};

use crate::progress::DetailedProgress;

/// Maximum accepted length of a source reference.
pub const MAX_SOURCE_LEN: usize = 2048;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Waiting,
    /// Held by a worker
    Active,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Waiting for a retry delay (or a delayed start) to elapse
    Delayed,
    /// Cancelled before completion
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobStatus::Waiting),
            "active" => Some(JobStatus::Active),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "delayed" => Some(JobStatus::Delayed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable input of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Reference handed to the downloader (URL, path, provider id, ...).
    pub source: String,
    /// Free-form parameters for the processing step.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl JobPayload {
    pub fn new(source: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            params,
        }
    }

    /// Reject malformed payloads before they reach the queue.
    pub fn validate(&self) -> DomainResult<()> {
        if self.source.trim().is_empty() {
            return Err(DomainError::validation("payload source must not be empty"));
        }
        if self.source.len() > MAX_SOURCE_LEN {
            return Err(DomainError::validation(format!(
                "payload source exceeds {MAX_SOURCE_LEN} bytes"
            )));
        }
        if !(self.params.is_object() || self.params.is_null()) {
            return Err(DomainError::validation("payload params must be an object"));
        }
        Ok(())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Delay policy applied between delivery attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the attempt following `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }
}

/// Submission options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Higher runs first; ties are FIFO.
    pub priority: i32,
    /// Hold the job back for this long after submission.
    pub delay: Option<Duration>,
    /// Delivery attempts before a step failure becomes terminal (minimum 1).
    pub max_attempts: u32,
    pub backoff: RetryPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: None,
            max_attempts: 1,
            backoff: RetryPolicy::default(),
        }
    }
}

impl JobOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_attempts(mut self, max_attempts: u32, backoff: RetryPolicy) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Whether a failure in delivery `attempt` may be retried.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Output of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Identifier of the persisted record (the result reference).
    pub record_id: String,
    /// Side metadata reported by the processing step.
    pub summary: serde_json::Value,
}

/// What `request_cancel` did to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was not running and is now `cancelled`.
    Cancelled,
    /// The job is running; the worker will stop before its next step.
    Requested,
    /// The job was already terminal or already asked to stop.
    Unchanged,
}

/// Status record of one job.
///
/// Transition methods return `true` when they changed the record and `false`
/// when the transition does not apply (already terminal, wrong state, stale
/// progress). Stores persist the record only when something changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub payload: JobPayload,
    pub options: JobOptions,
    pub status: JobStatus,
    /// Global progress, 0–100.
    pub progress: u8,
    pub progress_message: String,
    /// Present only when `status = completed`.
    pub result: Option<JobOutcome>,
    /// Present only when `status = failed`.
    pub error: Option<String>,
    /// Delivery attempts started so far.
    pub attempt: u32,
    pub cancel_requested: bool,
    /// Step-level snapshot; kept as the terminal snapshot once finished.
    pub detailed_progress: Option<DetailedProgress>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        owner_id: OwnerId,
        payload: JobPayload,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let status = if options.delay.is_some() {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };
        Self {
            id: JobId::new(),
            owner_id,
            payload,
            options,
            status,
            progress: 0,
            progress_message: "Queued".to_string(),
            result: None,
            error: None,
            attempt: 0,
            cancel_requested: false,
            detailed_progress: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Earliest moment a worker may pick the job up: creation plus any
    /// requested start delay.
    pub fn eligible_at(&self) -> DateTime<Utc> {
        let delay = self
            .options
            .delay
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(chrono::Duration::zero);
        self.created_at + delay
    }

    /// Time since the job became eligible to run; negative while a start
    /// delay is still pending.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.eligible_at()
    }

    /// A worker picked the job up for delivery `attempt`.
    ///
    /// Accepted from `waiting`/`delayed`, and from `active` when the queue
    /// redelivers after a lost lease. Progress is kept so it never moves
    /// backwards while the job stays active.
    pub fn mark_active(&mut self, attempt: u32, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Waiting | JobStatus::Delayed | JobStatus::Active => {
                if self.status == JobStatus::Active && attempt <= self.attempt {
                    return false;
                }
                self.status = JobStatus::Active;
                self.attempt = attempt.max(self.attempt);
                self.progress_message = "Starting".to_string();
                self.updated_at = now;
                true
            }
            _ => false,
        }
    }

    /// Mirror a tracker snapshot into the record.
    ///
    /// Ignored unless the job is active and the snapshot does not move
    /// progress backwards.
    pub fn apply_progress(&mut self, snapshot: &DetailedProgress, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Active || snapshot.global_progress < self.progress {
            return false;
        }
        self.progress = snapshot.global_progress;
        self.progress_message = snapshot.global_message.clone();
        self.detailed_progress = Some(snapshot.clone());
        self.updated_at = now;
        true
    }

    pub fn mark_completed(&mut self, outcome: JobOutcome, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.progress_message = "Completed".to_string();
        self.result = Some(outcome);
        self.error = None;
        self.finish(now);
        true
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let error = error.into();
        self.status = JobStatus::Failed;
        self.progress_message = format!("Failed: {error}");
        self.error = Some(error);
        self.result = None;
        self.finish(now);
        true
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.progress_message = "Cancelled".to_string();
        self.error = None;
        self.result = None;
        self.finish(now);
        true
    }

    /// Park an active job until its retry delay elapses.
    ///
    /// Progress restarts from zero for the next delivery.
    pub fn mark_delayed(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Active {
            return false;
        }
        self.status = JobStatus::Delayed;
        self.progress = 0;
        self.progress_message = format!("Retrying after error: {reason}");
        self.detailed_progress = None;
        self.updated_at = now;
        true
    }

    /// Cancel immediately when idle, or flag a running job for cooperative
    /// cancellation.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> CancelOutcome {
        match self.status {
            JobStatus::Waiting | JobStatus::Delayed => {
                self.mark_cancelled(now);
                CancelOutcome::Cancelled
            }
            JobStatus::Active if !self.cancel_requested => {
                self.cancel_requested = true;
                self.progress_message = "Cancelling".to_string();
                self.updated_at = now;
                CancelOutcome::Requested
            }
            _ => CancelOutcome::Unchanged,
        }
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.cancel_requested = false;
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepPlan;

    fn job() -> Job {
        Job::new(
            OwnerId::new(),
            JobPayload::new("https://example.org/hearing.mp4", serde_json::json!({})),
            JobOptions::default(),
            Utc::now(),
        )
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));

        let fixed = RetryPolicy::fixed(Duration::from_secs(2));
        assert_eq!(fixed.delay_for_attempt(1), fixed.delay_for_attempt(5));
    }

    #[test]
    fn payload_validation() {
        assert!(JobPayload::new("s3://bucket/a.mp3", serde_json::Value::Null).validate().is_ok());
        assert!(JobPayload::new("   ", serde_json::json!({})).validate().is_err());
        assert!(JobPayload::new("x", serde_json::json!([1, 2])).validate().is_err());
        assert!(JobPayload::new("x".repeat(MAX_SOURCE_LEN + 1), serde_json::json!({}))
            .validate()
            .is_err());
    }

    #[test]
    fn delayed_submission_starts_delayed() {
        let job = Job::new(
            OwnerId::new(),
            JobPayload::new("src", serde_json::json!({})),
            JobOptions::default().with_delay(Duration::from_secs(5)),
            Utc::now(),
        );
        assert_eq!(job.status, JobStatus::Delayed);
    }

    #[test]
    fn lifecycle_sets_completed_at_only_when_terminal() {
        let mut job = job();
        assert!(job.completed_at.is_none());

        assert!(job.mark_active(1, Utc::now()));
        assert_eq!(job.status, JobStatus::Active);
        assert!(job.completed_at.is_none());

        let outcome = JobOutcome {
            record_id: "rec-1".to_string(),
            summary: serde_json::json!({"words": 12}),
        };
        assert!(job.mark_completed(outcome, Utc::now()));
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
        assert!(job.error.is_none());

        // Terminal records ignore later transitions.
        assert!(!job.mark_failed("late", Utc::now()));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut job = job();
        job.mark_active(1, Utc::now());

        let plan = StepPlan::media_default();
        let mut snapshot = DetailedProgress::new(&plan, Utc::now());
        snapshot.global_progress = 40;
        assert!(job.apply_progress(&snapshot, Utc::now()));

        snapshot.global_progress = 25;
        assert!(!job.apply_progress(&snapshot, Utc::now()));
        assert_eq!(job.progress, 40);
    }

    #[test]
    fn redelivery_requires_newer_attempt() {
        let mut job = job();
        assert!(job.mark_active(1, Utc::now()));
        assert!(!job.mark_active(1, Utc::now()));
        assert!(job.mark_active(2, Utc::now()));
        assert_eq!(job.attempt, 2);
    }

    #[test]
    fn cancel_depends_on_state() {
        let mut idle = job();
        assert_eq!(idle.request_cancel(Utc::now()), CancelOutcome::Cancelled);
        assert_eq!(idle.status, JobStatus::Cancelled);
        assert!(idle.completed_at.is_some());
        assert_eq!(idle.request_cancel(Utc::now()), CancelOutcome::Unchanged);

        let mut running = job();
        running.mark_active(1, Utc::now());
        assert_eq!(running.request_cancel(Utc::now()), CancelOutcome::Requested);
        assert_eq!(running.status, JobStatus::Active);
        assert!(running.cancel_requested);
        assert_eq!(running.request_cancel(Utc::now()), CancelOutcome::Unchanged);
    }

    #[test]
    fn delayed_retry_resets_progress() {
        let mut job = job();
        job.mark_active(1, Utc::now());
        job.progress = 55;
        assert!(job.mark_delayed("network down", Utc::now()));
        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.progress, 0);
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn age_counts_from_the_end_of_the_start_delay() {
        let now = Utc::now();
        let created = now - chrono::Duration::hours(4);
        let plain = Job::new(
            OwnerId::new(),
            JobPayload::new("file:///a.wav", serde_json::json!({})),
            JobOptions::default(),
            created,
        );
        assert_eq!(plain.eligible_at(), created);
        assert_eq!(plain.age(now), chrono::Duration::hours(4));

        let delayed = Job::new(
            OwnerId::new(),
            JobPayload::new("file:///a.wav", serde_json::json!({})),
            JobOptions::default().with_delay(Duration::from_secs(5 * 3600)),
            created,
        );
        assert_eq!(delayed.eligible_at(), created + chrono::Duration::hours(5));
        assert!(delayed.age(now) < chrono::Duration::zero());
    }
}
