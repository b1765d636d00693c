use std::sync::Arc;

use anyhow::Context;

use civic_infra::PipelineConfig;
use civic_infra::jobs::sqlite::{connect, migrate};
use civic_infra::jobs::{
    CommandProcessor, FsDownloader, FsPersister, Pipeline, RecoveryService, SqliteJobQueue,
    SqliteJobStatusStore, Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    civic_observability::init();

    let config = PipelineConfig::from_env()?;
    let command = config
        .processor_command
        .as_deref()
        .and_then(CommandProcessor::from_command_line)
        .context("CIVIC_PROCESSOR_COMMAND must name the processing program")?;

    let pool = connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.database_url))?;
    migrate(&pool).await.context("failed to migrate job tables")?;

    let queue = Arc::new(SqliteJobQueue::new(pool.clone()));
    let store = Arc::new(SqliteJobStatusStore::new(pool));

    let processor = command.program().to_string();
    let pipeline = Pipeline::media(
        Arc::new(FsDownloader::new(&config.work_dir)),
        Arc::new(command),
        Arc::new(FsPersister::new(&config.output_dir)),
    );
    tracing::info!(
        steps = ?pipeline.plan().steps().iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        %processor,
        database = %config.database_url,
        concurrency = config.worker.concurrency,
        "starting civic worker"
    );

    // One pass before the worker takes any job; the loop's first pass is an
    // interval later.
    let recovery = RecoveryService::new(queue.clone(), store.clone(), config.recovery.clone());
    let report = recovery.run_once().await;
    tracing::info!(?report, "startup recovery finished");
    let recovery = recovery.spawn();

    let worker = Worker::new(queue, store, pipeline, config.worker.clone()).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    worker.shutdown().await;
    recovery.shutdown().await;

    Ok(())
}
