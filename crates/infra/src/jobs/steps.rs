//! Pipeline steps and the built-in download → process → persist runners.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use civic_core::{DomainError, DomainResult, JobId, OwnerId};
use civic_pipeline::{
    Downloader, FetchedArtifact, JobOutcome, JobPayload, Persister, ProcessedOutput, Processor,
    ProgressReporter, StepDescriptor, StepDetails, StepError, StepPlan, detail_keys,
};

use super::queue::Delivery;
use super::tracker::ProgressTracker;

/// Mutable state threaded through the steps of one delivery.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub owner_id: OwnerId,
    pub payload: JobPayload,
    pub attempt: u32,
    pub artifact: Option<FetchedArtifact>,
    pub output: Option<ProcessedOutput>,
    pub record_id: Option<String>,
}

impl JobContext {
    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            job_id: delivery.entry.job_id,
            owner_id: delivery.entry.owner_id,
            payload: delivery.entry.payload.clone(),
            attempt: delivery.attempt,
            artifact: None,
            output: None,
            record_id: None,
        }
    }

    /// Final job result, available once a record has been persisted.
    pub fn outcome(&self) -> Result<JobOutcome, StepError> {
        let record_id = self
            .record_id
            .clone()
            .ok_or_else(|| StepError::MissingInput("persisted record id".to_string()))?;
        let summary = self
            .output
            .as_ref()
            .map(|o| o.metadata.clone())
            .unwrap_or(serde_json::Value::Null);
        Ok(JobOutcome { record_id, summary })
    }
}

/// One step's view of the running job.
pub struct StepRun<'a> {
    pub job: &'a mut JobContext,
    tracker: &'a mut ProgressTracker,
    step: &'a str,
}

impl<'a> StepRun<'a> {
    pub fn new(job: &'a mut JobContext, tracker: &'a mut ProgressTracker, step: &'a str) -> Self {
        Self { job, tracker, step }
    }

    pub fn step(&self) -> &str {
        self.step
    }

    /// Report local progress (0–100) of this step.
    pub async fn report(&mut self, percent: u8, message: Option<String>) {
        self.tracker
            .update_step(self.step, percent, message, None)
            .await;
    }

    /// Report local progress together with details merged into the step.
    pub async fn report_details(&mut self, percent: u8, details: StepDetails) {
        self.tracker
            .update_step(self.step, percent, None, Some(details))
            .await;
    }
}

/// Runner bound to one named step of a plan.
///
/// Returned details are merged into the step on completion.
#[async_trait]
pub trait PipelineStep: Send + Sync + 'static {
    async fn run(&self, run: &mut StepRun<'_>) -> Result<StepDetails, StepError>;

    /// Release resources left in `job` once the delivery is over, whatever
    /// its outcome.
    async fn cleanup(&self, _job: &JobContext) {}
}

/// Step plan plus a runner for every step.
#[derive(Clone)]
pub struct Pipeline {
    plan: StepPlan,
    handlers: Vec<Arc<dyn PipelineStep>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("plan", &self.plan).finish()
    }
}

impl Pipeline {
    pub fn builder(plan: StepPlan) -> PipelineBuilder {
        PipelineBuilder {
            plan,
            handlers: HashMap::new(),
        }
    }

    /// The default media pipeline over the given collaborators.
    pub fn media(
        downloader: Arc<dyn Downloader>,
        processor: Arc<dyn Processor>,
        persister: Arc<dyn Persister>,
    ) -> Self {
        let plan = StepPlan::media_default();
        let handlers: Vec<Arc<dyn PipelineStep>> = vec![
            Arc::new(DownloadStep::new(downloader)),
            Arc::new(ProcessStep::new(processor)),
            Arc::new(PersistStep::new(persister)),
        ];
        Self { plan, handlers }
    }

    pub fn plan(&self) -> &StepPlan {
        &self.plan
    }

    pub fn steps(&self) -> impl Iterator<Item = (&StepDescriptor, &Arc<dyn PipelineStep>)> {
        self.plan.steps().iter().zip(self.handlers.iter())
    }

    /// Run every step's cleanup, last step first.
    pub async fn cleanup(&self, job: &JobContext) {
        for handler in self.handlers.iter().rev() {
            handler.cleanup(job).await;
        }
    }
}

/// Binds runners to a plan by step name.
pub struct PipelineBuilder {
    plan: StepPlan,
    handlers: HashMap<String, Arc<dyn PipelineStep>>,
}

impl PipelineBuilder {
    /// Register the runner for step `name`.
    pub fn register(mut self, name: impl Into<String>, step: impl PipelineStep) -> Self {
        self.handlers.insert(name.into(), Arc::new(step));
        self
    }

    pub fn build(mut self) -> DomainResult<Pipeline> {
        let mut handlers = Vec::with_capacity(self.plan.len());
        for descriptor in self.plan.steps() {
            let handler = self.handlers.remove(&descriptor.name).ok_or_else(|| {
                DomainError::validation(format!("no runner for step '{}'", descriptor.name))
            })?;
            handlers.push(handler);
        }
        if let Some(extra) = self.handlers.keys().next() {
            return Err(DomainError::validation(format!(
                "runner registered for unknown step '{extra}'"
            )));
        }
        Ok(Pipeline {
            plan: self.plan,
            handlers,
        })
    }
}

fn string_detail(details: &mut StepDetails, key: &str, value: impl Into<String>) {
    details.insert(key.to_string(), serde_json::Value::String(value.into()));
}

/// Copy `key` from collaborator metadata into step details when present.
fn lift_detail(details: &mut StepDetails, metadata: &serde_json::Value, key: &str) {
    if let Some(value) = metadata.get(key) {
        details.insert(key.to_string(), value.clone());
    }
}

/// Fetches the payload source.
pub struct DownloadStep {
    downloader: Arc<dyn Downloader>,
}

impl DownloadStep {
    pub fn new(downloader: Arc<dyn Downloader>) -> Self {
        Self { downloader }
    }
}

#[async_trait]
impl PipelineStep for DownloadStep {
    async fn run(&self, run: &mut StepRun<'_>) -> Result<StepDetails, StepError> {
        let source = run.job.payload.source.clone();
        let mut details = StepDetails::new();
        string_detail(&mut details, detail_keys::SOURCE, source.clone());
        run.report_details(0, details.clone()).await;

        let artifact = self.downloader.fetch(&source).await?;

        string_detail(
            &mut details,
            detail_keys::ARTIFACT_PATH,
            artifact.path.display().to_string(),
        );
        lift_detail(&mut details, &artifact.metadata, detail_keys::FILE_SIZE);

        run.job.artifact = Some(artifact);
        Ok(details)
    }

    async fn cleanup(&self, job: &JobContext) {
        let Some(artifact) = &job.artifact else {
            return;
        };
        if let Err(err) = self.downloader.release(artifact).await {
            warn!(job_id = %job.job_id, error = %err, "failed to release artifact");
        }
    }
}

/// Runs the heavy-compute collaborator, forwarding its progress reports.
pub struct ProcessStep {
    processor: Arc<dyn Processor>,
}

impl ProcessStep {
    pub fn new(processor: Arc<dyn Processor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl PipelineStep for ProcessStep {
    async fn run(&self, run: &mut StepRun<'_>) -> Result<StepDetails, StepError> {
        let path = run
            .job
            .artifact
            .as_ref()
            .map(|a| a.path.clone())
            .ok_or_else(|| StepError::MissingInput("downloaded artifact".to_string()))?;
        let params = run.job.payload.params.clone();

        let (reporter, mut rx) = ProgressReporter::channel();
        let processor = self.processor.clone();
        let work = async move { processor.run(&path, &params, reporter).await };
        tokio::pin!(work);

        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                Some(update) = rx.recv() => run.report(update.percent, update.message).await,
            }
        };
        while let Ok(update) = rx.try_recv() {
            run.report(update.percent, update.message).await;
        }

        let output = result?;
        let mut details = StepDetails::new();
        lift_detail(&mut details, &output.metadata, detail_keys::MODEL);
        lift_detail(&mut details, &output.metadata, detail_keys::ISSUES);

        run.job.output = Some(output);
        Ok(details)
    }
}

/// Commits the processed output.
pub struct PersistStep {
    persister: Arc<dyn Persister>,
}

impl PersistStep {
    pub fn new(persister: Arc<dyn Persister>) -> Self {
        Self { persister }
    }
}

#[async_trait]
impl PipelineStep for PersistStep {
    async fn run(&self, run: &mut StepRun<'_>) -> Result<StepDetails, StepError> {
        let output = run
            .job
            .output
            .as_ref()
            .ok_or_else(|| StepError::MissingInput("processed output".to_string()))?;
        let record_id = self
            .persister
            .save(run.job.owner_id, &output.result, &output.metadata)
            .await?;

        let mut details = StepDetails::new();
        string_detail(&mut details, detail_keys::RECORD_ID, record_id.clone());
        run.job.record_id = Some(record_id);
        Ok(details)
    }
}
