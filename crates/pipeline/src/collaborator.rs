//! Contracts for the external collaborators a pipeline calls into.
//!
//! Implementations own their transient-failure handling (network retries,
//! rate-limit backoff). Whatever error they finally return is terminal for the
//! step that called them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use civic_core::OwnerId;

/// Step-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("download failed: {0}")]
    Download(String),

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("step timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// A step ran without the output of the step it depends on.
    #[error("missing input: {0}")]
    MissingInput(String),
}

/// Result of [`Downloader::fetch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedArtifact {
    pub path: PathBuf,
    pub metadata: serde_json::Value,
}

/// Result of [`Processor::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedOutput {
    pub result: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// Local progress reported by a collaborator while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProgress {
    /// 0–100, local to the step.
    pub percent: u8,
    pub message: Option<String>,
}

/// Sending half handed to long-running collaborators.
///
/// Reports are best-effort: once the receiving step has finished they are
/// silently dropped.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<StepProgress>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StepProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Reporter whose updates go nowhere.
    pub fn disconnected() -> Self {
        let (reporter, _) = Self::channel();
        reporter
    }

    pub fn report(&self, percent: u8, message: Option<String>) {
        let _ = self.tx.send(StepProgress {
            percent: percent.min(100),
            message,
        });
    }
}

/// Fetches the job's source into a local artifact.
#[async_trait]
pub trait Downloader: Send + Sync + 'static {
    async fn fetch(&self, source: &str) -> Result<FetchedArtifact, StepError>;

    /// Drop whatever `fetch` left on disk. Called once the job is over,
    /// whatever its outcome.
    async fn release(&self, _artifact: &FetchedArtifact) -> Result<(), StepError> {
        Ok(())
    }
}

/// The heavy-compute step (transcription, inference, ...).
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn run(
        &self,
        artifact: &Path,
        params: &serde_json::Value,
        progress: ProgressReporter,
    ) -> Result<ProcessedOutput, StepError>;
}

/// Commits the final output to durable storage.
#[async_trait]
pub trait Persister: Send + Sync + 'static {
    /// Returns the identifier of the stored record.
    async fn save(
        &self,
        owner_id: OwnerId,
        result: &serde_json::Value,
        metadata: &serde_json::Value,
    ) -> Result<String, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reporter_clamps_and_delivers() {
        let (reporter, mut rx) = ProgressReporter::channel();
        reporter.report(150, Some("almost".to_string()));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.percent, 100);
        assert_eq!(got.message.as_deref(), Some("almost"));
    }

    #[test]
    fn disconnected_reporter_does_not_panic() {
        ProgressReporter::disconnected().report(10, None);
    }

    #[test]
    fn timeout_error_mentions_seconds() {
        let err = StepError::Timeout(Duration::from_secs(90));
        assert_eq!(err.to_string(), "step timed out after 90s");
    }
}
