use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use transq_common::JobDefaults;

use crate::converter::HandbrakeConverter;
use crate::monitor::ResourceLimits;
use crate::scheduler::{RetryPolicy, SchedulerConfig};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub converter: ConverterConfig,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Encoder settings for submissions that leave them out.
    #[serde(default)]
    pub defaults: JobDefaults,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Directory whose filesystem is checked for free space.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Re-queue jobs a previous run left unfinished.
    #[serde(default = "default_true")]
    pub resume_interrupted: bool,

    /// Finished jobs older than this are pruned on `run` startup (0 keeps everything).
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("transq.db")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            output_dir: default_output_dir(),
            resume_interrupted: default_true(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConverterConfig {
    /// HandBrakeCLI executable, looked up on PATH when not absolute.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Wall-clock limit for one conversion attempt.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Extra arguments appended to every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_binary() -> PathBuf {
    PathBuf::from("HandBrakeCLI")
}

fn default_timeout_secs() -> u64 {
    3600
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            timeout_secs: default_timeout_secs(),
            extra_args: Vec::new(),
        }
    }
}

impl ConverterConfig {
    pub fn build(&self) -> HandbrakeConverter {
        HandbrakeConverter::new(&self.binary)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_extra_args(self.extra_args.iter().cloned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSettings {
    /// Fixed worker count; sized from current load when unset.
    #[serde(default)]
    pub workers: Option<usize>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_admission_pause_secs")]
    pub admission_pause_secs: u64,

    #[serde(default = "default_retry_cooldown_secs")]
    pub retry_cooldown_secs: u64,

    #[serde(default)]
    pub retry_backoff: BackoffKind,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default)]
    pub kill_on_cancel: bool,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_admission_pause_secs() -> u64 {
    5
}

fn default_retry_cooldown_secs() -> u64 {
    30
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_cooldown_secs() -> u64 {
    600
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_history_limit() -> usize {
    1000
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: None,
            poll_interval_ms: default_poll_interval_ms(),
            admission_pause_secs: default_admission_pause_secs(),
            retry_cooldown_secs: default_retry_cooldown_secs(),
            retry_backoff: BackoffKind::default(),
            backoff_factor: default_backoff_factor(),
            max_cooldown_secs: default_max_cooldown_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            history_limit: default_history_limit(),
            kill_on_cancel: false,
        }
    }
}

impl SchedulerSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        let cooldown = Duration::from_secs(self.retry_cooldown_secs);
        match self.retry_backoff {
            BackoffKind::Fixed => RetryPolicy::fixed(cooldown),
            BackoffKind::Exponential => RetryPolicy::exponential(
                cooldown,
                self.backoff_factor,
                Duration::from_secs(self.max_cooldown_secs),
            ),
        }
    }

    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            admission_pause: Duration::from_secs(self.admission_pause_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            history_limit: self.history_limit,
            kill_on_cancel: self.kill_on_cancel,
            retry: self.retry_policy(),
        }
    }
}
