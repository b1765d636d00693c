//! Step descriptors and per-step state.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use civic_core::{DomainError, DomainResult};

/// Open key/value metadata attached to a step.
///
/// Commonly used keys are listed in [`detail_keys`].
pub type StepDetails = BTreeMap<String, serde_json::Value>;

/// Well-known keys of [`StepDetails`].
pub mod detail_keys {
    /// Size in bytes of a downloaded or produced artifact.
    pub const FILE_SIZE: &str = "file_size";
    /// Local path of the artifact produced by the download step.
    pub const ARTIFACT_PATH: &str = "artifact_path";
    /// Source reference the job was submitted with.
    pub const SOURCE: &str = "source";
    /// Name of the model/tool used by the heavy-compute step.
    pub const MODEL: &str = "model";
    /// List of issues detected while processing.
    pub const ISSUES: &str = "issues";
    /// Identifier of the persisted result record.
    pub const RECORD_ID: &str = "record_id";
    /// Failure description recorded by `FailStep`.
    pub const ERROR: &str = "error";
    /// Delivery attempt the step ran in.
    pub const ATTEMPT: &str = "attempt";
}

/// Inclusive slice `[min, max]` of the job's 0–100 progress scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRange {
    pub min: u8,
    pub max: u8,
}

impl GlobalRange {
    pub fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    pub fn width(&self) -> u8 {
        self.max.saturating_sub(self.min)
    }

    /// Map a step-local percentage onto the global scale.
    ///
    /// `min + (max - min) * local / 100`, floored; `local` is clamped to 100.
    pub fn interpolate(&self, local: u8) -> u8 {
        let local = u32::from(local.min(100));
        let offset = u32::from(self.width()) * local / 100;
        self.min + offset as u8
    }
}

/// Static description of one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Stable identifier, used in progress events.
    pub name: String,
    /// Display text.
    pub label: String,
    pub range: GlobalRange,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>, label: impl Into<String>, min: u8, max: u8) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            range: GlobalRange::new(min, max),
        }
    }
}

/// Ordered, validated list of step descriptors for one job type.
///
/// Ranges are contiguous, non-overlapping, start at 0 and end at 100. Each
/// step owns a non-empty slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPlan {
    steps: Vec<StepDescriptor>,
}

impl StepPlan {
    /// Build a plan from explicit ranges.
    pub fn new(steps: Vec<StepDescriptor>) -> DomainResult<Self> {
        let (first, last) = match (steps.first(), steps.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(DomainError::invariant("step plan must contain at least one step")),
        };

        if first.range.min != 0 {
            return Err(DomainError::invariant(format!(
                "first step '{}' must start at 0, starts at {}",
                first.name, first.range.min
            )));
        }
        if last.range.max != 100 {
            return Err(DomainError::invariant(format!(
                "last step '{}' must end at 100, ends at {}",
                last.name, last.range.max
            )));
        }

        let mut names = HashSet::with_capacity(steps.len());
        for step in &steps {
            if step.name.trim().is_empty() {
                return Err(DomainError::invariant("step name must not be empty"));
            }
            if !names.insert(step.name.as_str()) {
                return Err(DomainError::invariant(format!("duplicate step name '{}'", step.name)));
            }
            if step.range.min >= step.range.max {
                return Err(DomainError::invariant(format!(
                    "step '{}' has an empty range [{}, {}]",
                    step.name, step.range.min, step.range.max
                )));
            }
        }

        for pair in steps.windows(2) {
            if pair[0].range.max != pair[1].range.min {
                return Err(DomainError::invariant(format!(
                    "steps '{}' and '{}' are not contiguous ({} != {})",
                    pair[0].name, pair[1].name, pair[0].range.max, pair[1].range.min
                )));
            }
        }

        Ok(Self { steps })
    }

    /// Build a plan from relative weights; ranges are derived so that each
    /// step gets at least one point and the total is exactly 100.
    pub fn weighted(steps: &[(&str, &str, u32)]) -> DomainResult<Self> {
        if steps.is_empty() {
            return Err(DomainError::invariant("step plan must contain at least one step"));
        }
        if steps.len() > 100 {
            return Err(DomainError::invariant("a step plan holds at most 100 steps"));
        }
        if steps.iter().any(|(_, _, w)| *w == 0) {
            return Err(DomainError::invariant("step weights must be positive"));
        }

        let total: u64 = steps.iter().map(|(_, _, w)| u64::from(*w)).sum();
        let mut widths: Vec<u64> = steps
            .iter()
            .map(|(_, _, w)| (100 * u64::from(*w) / total).max(1))
            .collect();

        let mut sum: u64 = widths.iter().sum();
        while sum < 100 {
            let idx = heaviest(steps);
            widths[idx] += 1;
            sum += 1;
        }
        while sum > 100 {
            // Shrink the widest step that can still give up a point.
            let idx = widths
                .iter()
                .enumerate()
                .filter(|(_, w)| **w > 1)
                .max_by_key(|(_, w)| **w)
                .map(|(i, _)| i)
                .ok_or_else(|| DomainError::invariant("cannot fit step weights into 0..=100"))?;
            widths[idx] -= 1;
            sum -= 1;
        }

        let mut min = 0u8;
        let descriptors = steps
            .iter()
            .zip(widths)
            .map(|((name, label, _), width)| {
                let max = min + width as u8;
                let d = StepDescriptor::new(*name, *label, min, max);
                min = max;
                d
            })
            .collect();

        Self::new(descriptors)
    }

    /// Download → process → persist, the plan media jobs run with.
    pub fn media_default() -> Self {
        Self {
            steps: vec![
                StepDescriptor::new("download", "Downloading source", 0, 20),
                StepDescriptor::new("process", "Processing", 20, 90),
                StepDescriptor::new("persist", "Saving results", 90, 100),
            ],
        }
    }

    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    pub fn get(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn heaviest(steps: &[(&str, &str, u32)]) -> usize {
    steps
        .iter()
        .enumerate()
        .max_by_key(|(i, (_, _, w))| (*w, core::cmp::Reverse(*i)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

/// Runtime state of one step inside a [`crate::DetailedProgress`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub label: String,
    pub status: StepStatus,
    /// Step-local progress, 0–100.
    pub progress: u8,
    pub global_range: GlobalRange,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub details: StepDetails,
}

impl StepState {
    pub fn pending(descriptor: &StepDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            label: descriptor.label.clone(),
            status: StepStatus::Pending,
            progress: 0,
            global_range: descriptor.range,
            start_time: None,
            end_time: None,
            details: StepDetails::new(),
        }
    }

    /// Wall-clock time spent in the step, once it has ended.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
