//! Runtime configuration for the job pipeline, read from `CIVIC_*` variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{RecoveryConfig, WorkerConfig};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://civic-jobs.db";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Everything the worker binary needs to wire the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub worker: WorkerConfig,
    pub recovery: RecoveryConfig,
    /// Where downloaded artifacts land
    pub work_dir: PathBuf,
    /// Where persisted results are written
    pub output_dir: PathBuf,
    /// Command line of the processing program
    pub processor_command: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            worker: WorkerConfig::default(),
            recovery: RecoveryConfig::default(),
            work_dir: std::env::temp_dir().join("civic-work"),
            output_dir: PathBuf::from("civic-output"),
            processor_command: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let mut config = Self::default();

        if let Some(url) = vars.string("CIVIC_DATABASE_URL") {
            config.database_url = url;
        }

        let mut worker = config.worker;
        if let Some(n) = vars.parse::<usize>("CIVIC_WORKER_CONCURRENCY")? {
            if n == 0 {
                return Err(invalid("CIVIC_WORKER_CONCURRENCY", n));
            }
            worker = worker.with_concurrency(n);
        }

        let max = vars.parse::<u32>("CIVIC_RATE_LIMIT_MAX")?;
        let window = vars.parse::<u64>("CIVIC_RATE_LIMIT_WINDOW_SECS")?;
        match (max, window) {
            (Some(0), _) => worker = worker.without_rate_limit(),
            (None, None) => {}
            (max, window) => {
                let defaults = worker.rate_limit.unwrap_or_default();
                if window == Some(0) {
                    return Err(invalid("CIVIC_RATE_LIMIT_WINDOW_SECS", 0));
                }
                worker = worker.with_rate_limit(
                    max.unwrap_or(defaults.max),
                    window.map(Duration::from_secs).unwrap_or(defaults.window),
                );
            }
        }

        if let Some(secs) = vars.parse::<u64>("CIVIC_LEASE_TTL_SECS")? {
            if secs == 0 {
                return Err(invalid("CIVIC_LEASE_TTL_SECS", secs));
            }
            worker = worker.with_lease_ttl(Duration::from_secs(secs));
        }
        if let Some(ms) = vars.parse::<u64>("CIVIC_POLL_INTERVAL_MS")? {
            worker = worker.with_poll_interval(Duration::from_millis(ms.max(1)));
        }
        match vars.parse::<u64>("CIVIC_STEP_TIMEOUT_SECS")? {
            Some(0) => worker.step_timeout = None,
            Some(secs) => worker = worker.with_step_timeout(Duration::from_secs(secs)),
            None => {}
        }

        let mut recovery = config.recovery;
        if let Some(secs) = vars.parse::<u64>("CIVIC_RECOVERY_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(invalid("CIVIC_RECOVERY_INTERVAL_SECS", secs));
            }
            recovery = recovery.with_interval(Duration::from_secs(secs));
        }
        if let Some(hours) = vars.parse::<u64>("CIVIC_JOB_TIMEOUT_HOURS")? {
            let secs = hours
                .checked_mul(60 * 60)
                .filter(|&s| s > 0)
                .ok_or_else(|| invalid("CIVIC_JOB_TIMEOUT_HOURS", hours))?;
            recovery = recovery.with_job_timeout(Duration::from_secs(secs));
        }
        if let Some(days) = vars.parse::<u64>("CIVIC_RETENTION_DAYS")? {
            let secs = days
                .checked_mul(24 * 60 * 60)
                .ok_or_else(|| invalid("CIVIC_RETENTION_DAYS", days))?;
            recovery = recovery.with_retention(Duration::from_secs(secs));
        }
        if let Some(secs) = vars.parse::<u64>("CIVIC_ORPHAN_GRACE_SECS")? {
            recovery = recovery.with_orphan_grace(Duration::from_secs(secs));
        }
        // A record younger than one lease may still be on its way into the queue.
        if recovery.orphan_grace < worker.lease_ttl {
            recovery = recovery.with_orphan_grace(worker.lease_ttl);
        }
        config.worker = worker;
        config.recovery = recovery;

        if let Some(dir) = vars.string("CIVIC_WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(dir) = vars.string("CIVIC_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        config.processor_command = vars.string("CIVIC_PROCESSOR_COMMAND");

        Ok(config)
    }
}

fn invalid(key: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank are the same.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        match self.string(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| invalid(key, raw)),
        }
    }
}
