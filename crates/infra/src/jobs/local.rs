//! Local collaborators for single-host deployments: filesystem download,
//! external command processing and JSON-file persistence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use civic_core::OwnerId;
use civic_pipeline::{
    Downloader, FetchedArtifact, Persister, ProcessedOutput, Processor, ProgressReporter,
    StepError,
};

/// Copies a local source (`file://` URL or plain path) into a work directory.
#[derive(Debug, Clone)]
pub struct FsDownloader {
    work_dir: PathBuf,
}

impl FsDownloader {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    fn local_path(source: &str) -> Result<PathBuf, StepError> {
        if let Some(path) = source.strip_prefix("file://") {
            return Ok(PathBuf::from(path));
        }
        if let Some((scheme, _)) = source.split_once("://") {
            return Err(StepError::Download(format!(
                "unsupported source scheme: {scheme}"
            )));
        }
        Ok(PathBuf::from(source))
    }
}

#[async_trait]
impl Downloader for FsDownloader {
    async fn fetch(&self, source: &str) -> Result<FetchedArtifact, StepError> {
        let from = Self::local_path(source)?;
        let file_name = from
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StepError::Download(format!("source has no file name: {source}")))?;

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| StepError::Download(format!("cannot create work dir: {e}")))?;

        let to = self.work_dir.join(format!("{}-{file_name}", Uuid::now_v7()));
        let size = tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| StepError::Download(format!("{}: {e}", from.display())))?;

        debug!(source, artifact = %to.display(), size, "source copied");
        Ok(FetchedArtifact {
            path: to,
            metadata: json!({ "file_size": size, "source": source }),
        })
    }

    /// Removes the copy. Paths outside the work directory are never touched.
    async fn release(&self, artifact: &FetchedArtifact) -> Result<(), StepError> {
        if !artifact.path.starts_with(&self.work_dir) {
            return Ok(());
        }
        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => {
                debug!(artifact = %artifact.path.display(), "artifact removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StepError::Download(format!(
                "cannot remove {}: {e}",
                artifact.path.display()
            ))),
        }
    }
}

/// Runs an external program with the artifact path as its last argument.
///
/// Stdout becomes the result: parsed as JSON when possible, otherwise kept as
/// a string. Job params are passed in `CIVIC_JOB_PARAMS`.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
}

impl CommandProcessor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a shell-like command line on whitespace.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn run(
        &self,
        artifact: &Path,
        params: &serde_json::Value,
        progress: ProgressReporter,
    ) -> Result<ProcessedOutput, StepError> {
        progress.report(0, Some(format!("Running {}", self.program)));

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(artifact)
            .env("CIVIC_JOB_PARAMS", params.to_string())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StepError::Processing(format!("cannot start {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StepError::Processing(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result = serde_json::from_str(&stdout)
            .unwrap_or_else(|_| serde_json::Value::String(stdout.trim().to_string()));

        progress.report(100, None);
        Ok(ProcessedOutput {
            result,
            metadata: json!({ "model": self.program }),
        })
    }
}

/// Writes `{result, metadata}` to `<output_dir>/<owner>/<record>.json`.
#[derive(Debug, Clone)]
pub struct FsPersister {
    output_dir: PathBuf,
}

impl FsPersister {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn record_path(&self, owner_id: OwnerId, record_id: &str) -> PathBuf {
        self.output_dir
            .join(owner_id.to_string())
            .join(format!("{record_id}.json"))
    }
}

#[async_trait]
impl Persister for FsPersister {
    async fn save(
        &self,
        owner_id: OwnerId,
        result: &serde_json::Value,
        metadata: &serde_json::Value,
    ) -> Result<String, StepError> {
        let record_id = Uuid::now_v7().to_string();
        let path = self.record_path(owner_id, &record_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StepError::Persistence(format!("cannot create output dir: {e}")))?;
        }

        let body = serde_json::to_vec_pretty(&json!({ "result": result, "metadata": metadata }))
            .map_err(|e| StepError::Persistence(e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| StepError::Persistence(format!("{}: {e}", path.display())))?;

        Ok(record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn downloader_copies_local_file() {
        let src_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let source = src_dir.path().join("talk.wav");
        tokio::fs::write(&source, b"RIFF....").await.unwrap();

        let downloader = FsDownloader::new(work_dir.path());
        let artifact = downloader
            .fetch(&format!("file://{}", source.display()))
            .await
            .unwrap();

        assert!(artifact.path.starts_with(work_dir.path()));
        assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), b"RIFF....");
        assert_eq!(artifact.metadata["file_size"], 8);
    }

    #[tokio::test]
    async fn downloader_rejects_remote_and_missing_sources() {
        let work_dir = tempfile::tempdir().unwrap();
        let downloader = FsDownloader::new(work_dir.path());

        let err = downloader.fetch("https://example.org/a.mp3").await.unwrap_err();
        assert!(matches!(err, StepError::Download(msg) if msg.contains("https")));

        let missing = work_dir.path().join("nope.mp3");
        let err = downloader.fetch(missing.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, StepError::Download(_)));
    }

    #[tokio::test]
    async fn release_removes_only_copies_in_the_work_dir() {
        let src_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let source = src_dir.path().join("talk.wav");
        tokio::fs::write(&source, b"RIFF").await.unwrap();

        let downloader = FsDownloader::new(work_dir.path());
        let artifact = downloader.fetch(source.to_str().unwrap()).await.unwrap();
        downloader.release(&artifact).await.unwrap();
        assert!(!artifact.path.exists());
        // Second release is a no-op.
        downloader.release(&artifact).await.unwrap();

        let outside = FetchedArtifact {
            path: source.clone(),
            metadata: serde_json::Value::Null,
        };
        downloader.release(&outside).await.unwrap();
        assert!(source.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_output_becomes_result() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("out.json");
        tokio::fs::write(&artifact, br#"{"text":"hello"}"#).await.unwrap();

        let processor = CommandProcessor::new("cat", Vec::new());
        let (reporter, mut rx) = ProgressReporter::channel();
        let output = processor
            .run(&artifact, &serde_json::json!({}), reporter)
            .await
            .unwrap();

        assert_eq!(output.result, serde_json::json!({"text": "hello"}));
        assert_eq!(output.metadata["model"], "cat");
        assert_eq!(rx.recv().await.unwrap().percent, 0);
        assert_eq!(rx.recv().await.unwrap().percent, 100);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_a_processing_error() {
        let dir = tempfile::tempdir().unwrap();
        let processor = CommandProcessor::from_command_line("false").unwrap();
        let err = processor
            .run(dir.path(), &serde_json::Value::Null, ProgressReporter::disconnected())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Processing(_)));
    }

    #[test]
    fn command_line_splits_program_and_args() {
        let processor = CommandProcessor::from_command_line("whisper --model base").unwrap();
        assert_eq!(processor.program(), "whisper");
        assert_eq!(processor.args, vec!["--model", "base"]);
        assert!(CommandProcessor::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn persister_writes_record_under_owner() {
        let dir = tempfile::tempdir().unwrap();
        let persister = FsPersister::new(dir.path());
        let owner = OwnerId::new();

        let record_id = persister
            .save(owner, &serde_json::json!({"text": "hi"}), &serde_json::json!({"model": "m"}))
            .await
            .unwrap();

        let raw = tokio::fs::read(persister.record_path(owner, &record_id))
            .await
            .unwrap();
        let stored: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored["result"]["text"], "hi");
        assert_eq!(stored["metadata"]["model"], "m");
    }
}
