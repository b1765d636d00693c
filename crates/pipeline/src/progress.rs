//! Detailed progress snapshots and the pure update function.
//!
//! The worker owns one [`DetailedProgress`] per running job and feeds it
//! [`ProgressEvent`]s through [`apply_update`]; publishing the resulting
//! snapshot to storage is a separate, side-effecting step in `civic-infra`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::step::{StepDetails, StepPlan, StepState, StepStatus, detail_keys};

/// Progress of one running job, step by step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedProgress {
    /// 0–100, non-decreasing.
    pub global_progress: u8,
    pub global_message: String,
    pub current_step: Option<String>,
    pub steps: Vec<StepState>,
    /// `None` until some progress has been made.
    pub estimated_time_remaining: Option<Duration>,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl DetailedProgress {
    /// Fresh snapshot with every step pending.
    pub fn new(plan: &StepPlan, now: DateTime<Utc>) -> Self {
        Self {
            global_progress: 0,
            global_message: "Starting".to_string(),
            current_step: None,
            steps: plan.steps().iter().map(StepState::pending).collect(),
            estimated_time_remaining: None,
            started_at: now,
            last_update: now,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn active_step(&self) -> Option<&StepState> {
        self.steps.iter().find(|s| s.status == StepStatus::Active)
    }
}

/// One mutation emitted by the worker while running a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StartStep {
        name: String,
        message: String,
        details: Option<StepDetails>,
    },
    UpdateStep {
        name: String,
        progress: u8,
        message: Option<String>,
        details: Option<StepDetails>,
    },
    CompleteStep {
        name: String,
        details: Option<StepDetails>,
    },
    FailStep {
        name: String,
        error: String,
    },
}

impl ProgressEvent {
    pub fn step_name(&self) -> &str {
        match self {
            ProgressEvent::StartStep { name, .. }
            | ProgressEvent::UpdateStep { name, .. }
            | ProgressEvent::CompleteStep { name, .. }
            | ProgressEvent::FailStep { name, .. } => name,
        }
    }
}

/// Why an event was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgressError {
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// Starting a step before its predecessors completed, or while another
    /// step is still active.
    #[error("step '{0}' started out of order")]
    OutOfOrder(String),

    #[error("step '{name}' is {status:?}, cannot apply {event}")]
    InvalidState {
        name: String,
        status: StepStatus,
        event: &'static str,
    },
}

/// Apply `event` to `snapshot` at time `now`, returning the new snapshot.
///
/// Global progress is pinned to the step's range: `min` on start, linear
/// interpolation on update, `max` on completion, unchanged on failure. It
/// never decreases.
pub fn apply_update(
    snapshot: &DetailedProgress,
    event: &ProgressEvent,
    now: DateTime<Utc>,
) -> Result<DetailedProgress, ProgressError> {
    let name = event.step_name();
    let idx = snapshot
        .steps
        .iter()
        .position(|s| s.name == name)
        .ok_or_else(|| ProgressError::UnknownStep(name.to_string()))?;

    let mut next = snapshot.clone();

    match event {
        ProgressEvent::StartStep {
            message, details, ..
        } => {
            let predecessors_done = next.steps[..idx]
                .iter()
                .all(|s| s.status == StepStatus::Completed);
            if !predecessors_done || next.active_step().is_some() {
                return Err(ProgressError::OutOfOrder(name.to_string()));
            }
            let step = &mut next.steps[idx];
            ensure_status(step, StepStatus::Pending, "start")?;

            step.status = StepStatus::Active;
            step.progress = 0;
            step.start_time = Some(now);
            merge_details(step, details.as_ref());

            let floor = step.global_range.min;
            next.global_progress = next.global_progress.max(floor);
            next.current_step = Some(name.to_string());
            next.global_message = message.clone();
        }
        ProgressEvent::UpdateStep {
            progress,
            message,
            details,
            ..
        } => {
            let step = &mut next.steps[idx];
            ensure_status(step, StepStatus::Active, "update")?;

            step.progress = step.progress.max((*progress).min(100));
            merge_details(step, details.as_ref());

            let global = step.global_range.interpolate(step.progress);
            next.global_progress = next.global_progress.max(global);
            if let Some(message) = message {
                next.global_message = message.clone();
            }
        }
        ProgressEvent::CompleteStep { details, .. } => {
            let step = &mut next.steps[idx];
            ensure_status(step, StepStatus::Active, "complete")?;

            step.status = StepStatus::Completed;
            step.progress = 100;
            step.end_time = Some(now);
            merge_details(step, details.as_ref());

            let ceiling = step.global_range.max;
            next.global_progress = next.global_progress.max(ceiling);
        }
        ProgressEvent::FailStep { error, .. } => {
            let step = &mut next.steps[idx];
            if !matches!(step.status, StepStatus::Pending | StepStatus::Active) {
                return Err(ProgressError::InvalidState {
                    name: name.to_string(),
                    status: step.status,
                    event: "fail",
                });
            }

            step.status = StepStatus::Failed;
            step.end_time = Some(now);
            step.details.insert(
                detail_keys::ERROR.to_string(),
                serde_json::Value::String(error.clone()),
            );
            next.global_message = format!("{} failed: {error}", step.label);
        }
    }

    next.estimated_time_remaining = estimate_remaining(next.started_at, now, next.global_progress);
    next.last_update = now;
    Ok(next)
}

/// Time-remaining heuristic: `elapsed * (100 / progress - 1)`.
///
/// Assumes progress accrues at a constant rate over the whole job. `None`
/// before any progress.
pub fn estimate_remaining(
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    global_progress: u8,
) -> Option<Duration> {
    if global_progress == 0 {
        return None;
    }
    let elapsed_ms = (now - started_at).num_milliseconds().max(0) as u128;
    let progress = u128::from(global_progress.min(100));
    let remaining_ms = elapsed_ms * (100 - progress) / progress;
    Some(Duration::from_millis(remaining_ms as u64))
}

fn ensure_status(
    step: &StepState,
    expected: StepStatus,
    event: &'static str,
) -> Result<(), ProgressError> {
    if step.status == expected {
        Ok(())
    } else {
        Err(ProgressError::InvalidState {
            name: step.name.clone(),
            status: step.status,
            event,
        })
    }
}

fn merge_details(step: &mut StepState, details: Option<&StepDetails>) {
    if let Some(details) = details {
        step.details
            .extend(details.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}
