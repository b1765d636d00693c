//! Infrastructure layer: job queue, status store, worker runtime, recovery.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, PipelineConfig};
