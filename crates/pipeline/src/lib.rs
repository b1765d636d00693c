//! `civic-pipeline`: the pure model of a multi-step background job.
//!
//! ## Components
//!
//! - `Job`: the status record of one submitted job and its lifecycle transitions
//! - `StepPlan`: ordered step descriptors, each owning a fixed slice of 0–100
//! - `DetailedProgress` + `apply_update`: progress snapshots and the pure
//!   interpolation/ETA math driven by `ProgressEvent`s
//! - `Downloader` / `Processor` / `Persister`: contracts for the external
//!   collaborators the pipeline steps call into
//!
//! Storage, queueing and scheduling live in `civic-infra`.

pub mod collaborator;
pub mod job;
pub mod progress;
pub mod step;

pub use collaborator::{
    Downloader, FetchedArtifact, Persister, ProcessedOutput, Processor, ProgressReporter,
    StepError, StepProgress,
};
pub use job::{
    BackoffStrategy, CancelOutcome, Job, JobOptions, JobOutcome, JobPayload, JobStatus,
    RetryPolicy,
};
pub use progress::{DetailedProgress, ProgressError, ProgressEvent, apply_update, estimate_remaining};
pub use step::{GlobalRange, StepDescriptor, StepDetails, StepPlan, StepState, StepStatus, detail_keys};
