//! Background job pipeline with leases, progress tracking and crash recovery.
//!
//! ## Design
//!
//! - Jobs are owner-scoped and run a fixed, ordered list of steps
//! - The queue is the only delivery authority (leases + heartbeats)
//! - The status store is the source of truth for callers polling progress
//! - Step failures become terminal job failures, never worker crashes
//! - A recovery pass repairs orphaned, lagging and timed-out records
//!
//! ## Components
//!
//! - `JobQueue`: at-least-once delivery (in-memory or SQLite)
//! - `JobStatusStore`: durable lifecycle records (in-memory or SQLite)
//! - `ProgressTracker`: applies progress events and publishes snapshots
//! - `Pipeline` / `PipelineStep`: step descriptors bound to their runners
//! - `Worker`: concurrency- and rate-limited consumer
//! - `RecoveryService`: startup + periodic reconciliation and retention
//! - `JobService`: submit / status / list / cancel / retry facade

pub mod limiter;
pub mod local;
pub mod queue;
pub mod recovery;
pub mod service;
pub mod sqlite;
pub mod steps;
pub mod store;
pub mod tracker;
pub mod worker;

pub use limiter::RateLimiter;
pub use local::{CommandProcessor, FsDownloader, FsPersister};
pub use queue::{
    Delivery, InMemoryJobQueue, JobQueue, Lease, QueueEntry, QueueError, QueueState, QueueStats,
};
pub use recovery::{RecoveryConfig, RecoveryHandle, RecoveryReport, RecoveryService};
pub use service::{JobService, ServiceError};
pub use sqlite::{SqliteJobQueue, SqliteJobStatusStore};
pub use steps::{
    DownloadStep, JobContext, PersistStep, Pipeline, PipelineBuilder, PipelineStep, ProcessStep,
    StepRun,
};
pub use store::{InMemoryJobStatusStore, JobStatusStore, StoreError};
pub use tracker::ProgressTracker;
pub use worker::{JobReport, RateLimit, Worker, WorkerConfig, WorkerHandle, WorkerStats};
