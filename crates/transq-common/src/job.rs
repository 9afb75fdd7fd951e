//! The conversion job model.
//!
//! A [`Job`] carries the encoder parameters for one conversion together with
//! its lifecycle state. Transition helpers (`start`, `record_progress`,
//! `complete`, ...) are the only place lifecycle fields change, so callers
//! that own a job get the status invariants for free.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::ids::JobId;

pub const DEFAULT_QUALITY: u32 = 23;
pub const DEFAULT_RESOLUTION: &str = "720x480";
pub const DEFAULT_VIDEO_BITRATE: u32 = 1000;
pub const DEFAULT_AUDIO_BITRATE: u32 = 96;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Highest value on the HandBrake constant-quality (RF) scale.
pub const MAX_QUALITY: u32 = 51;

/// Current time truncated to microseconds.
///
/// Stored timestamps carry microsecond precision, so truncating up front
/// keeps in-memory jobs equal to what the store reads back.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Retrying,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, Failed and Cancelled are final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "retrying" => Ok(JobStatus::Retrying),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::invalid_input(format!("unknown job status: {other}"))),
        }
    }
}

/// Encoder parameters for a single conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionParams {
    pub input_path: String,
    pub output_path: String,
    /// Constant-quality factor (lower is better).
    pub quality: u32,
    /// Target frame size as `WIDTHxHEIGHT`.
    pub resolution: String,
    /// Video bitrate in kbps.
    pub video_bitrate: u32,
    /// Audio bitrate in kbps.
    pub audio_bitrate: u32,
}

impl ConversionParams {
    /// Parameters with the default encoder settings.
    pub fn new(input_path: impl Into<String>, output_path: impl Into<String>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            quality: DEFAULT_QUALITY,
            resolution: DEFAULT_RESOLUTION.to_string(),
            video_bitrate: DEFAULT_VIDEO_BITRATE,
            audio_bitrate: DEFAULT_AUDIO_BITRATE,
        }
    }

    /// Parse `resolution` into `(width, height)`.
    ///
    /// Accepts `x` or `X` as separator; both sides must be positive integers.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        parse_resolution(&self.resolution)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_path.trim().is_empty() {
            return Err(Error::invalid_input("input_path must not be empty"));
        }
        if self.output_path.trim().is_empty() {
            return Err(Error::invalid_input("output_path must not be empty"));
        }
        if self.quality > MAX_QUALITY {
            return Err(Error::invalid_input(format!(
                "quality must be between 0 and {MAX_QUALITY}, got {}",
                self.quality
            )));
        }
        if self.dimensions().is_none() {
            return Err(Error::invalid_input(format!(
                "resolution must look like 1280x720, got {:?}",
                self.resolution
            )));
        }
        Ok(())
    }
}

/// Parse a `WIDTHxHEIGHT` string.
pub fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.trim().split_once(['x', 'X'])?;
    let width: u32 = w.trim().parse().ok()?;
    let height: u32 = h.trim().parse().ok()?;
    (width > 0 && height > 0).then_some((width, height))
}

/// A conversion job and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(flatten)]
    pub params: ConversionParams,
    pub status: JobStatus,
    /// Percent complete, 0 to 100.
    pub progress: f64,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, params: ConversionParams) -> Self {
        Self {
            id,
            params,
            status: JobStatus::Pending,
            progress: 0.0,
            error_message: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Mark the job as running. `started_at` records the first dispatch and
    /// is kept across retries.
    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(now());
        }
    }

    /// Record progress in percent. Returns `true` when the stored value
    /// changed; progress only moves forward while the job is running.
    pub fn record_progress(&mut self, percent: f64) -> bool {
        if self.status != JobStatus::Running || percent.is_nan() {
            return false;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent > self.progress {
            self.progress = percent;
            true
        } else {
            false
        }
    }

    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.progress = 100.0;
        self.error_message = None;
        self.completed_at = Some(now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = JobStatus::Failed;
        self.error_message = Some(error.to_string());
        self.completed_at = Some(now());
    }

    /// Consume one retry after a failed attempt.
    pub fn mark_retrying(&mut self, error: &str) {
        self.status = JobStatus::Retrying;
        self.retry_count += 1;
        self.error_message = Some(error.to_string());
    }

    /// Put a cooled-down job back into the pending state for a fresh attempt.
    pub fn requeue(&mut self) {
        self.status = JobStatus::Pending;
        self.progress = 0.0;
    }

    pub fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now());
    }
}

/// Defaults applied to submissions that omit encoder settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_quality")]
    pub quality: u32,

    #[serde(default = "default_resolution")]
    pub resolution: String,

    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: u32,

    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_quality() -> u32 {
    DEFAULT_QUALITY
}

fn default_resolution() -> String {
    DEFAULT_RESOLUTION.to_string()
}

fn default_video_bitrate() -> u32 {
    DEFAULT_VIDEO_BITRATE
}

fn default_audio_bitrate() -> u32 {
    DEFAULT_AUDIO_BITRATE
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            resolution: default_resolution(),
            video_bitrate: default_video_bitrate(),
            audio_bitrate: default_audio_bitrate(),
            max_retries: default_max_retries(),
        }
    }
}

/// A request to convert one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Caller-chosen id; a UUID is generated when absent.
    #[serde(default)]
    pub job_id: Option<String>,
    pub input_path: String,
    pub output_path: String,
    #[serde(default)]
    pub quality: Option<u32>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub video_bitrate: Option<u32>,
    #[serde(default)]
    pub audio_bitrate: Option<u32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl SubmitRequest {
    pub fn new(input_path: impl Into<String>, output_path: impl Into<String>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            ..Default::default()
        }
    }

    /// Build a validated pending job, filling omitted settings from `defaults`.
    pub fn into_job(self, defaults: &JobDefaults) -> Result<Job> {
        let id = match self.job_id {
            Some(id) if id.trim().is_empty() => {
                return Err(Error::invalid_input("job_id must not be empty"))
            }
            Some(id) => JobId::new(id),
            None => JobId::generate(),
        };

        let params = ConversionParams {
            input_path: self.input_path,
            output_path: self.output_path,
            quality: self.quality.unwrap_or(defaults.quality),
            resolution: self
                .resolution
                .unwrap_or_else(|| defaults.resolution.clone()),
            video_bitrate: self.video_bitrate.unwrap_or(defaults.video_bitrate),
            audio_bitrate: self.audio_bitrate.unwrap_or(defaults.audio_bitrate),
        };
        params.validate()?;

        Ok(Job::new(id, params).with_max_retries(self.max_retries.unwrap_or(defaults.max_retries)))
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    /// `false` when a job with the same id is already tracked.
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_job() -> Job {
        let mut job = Job::new(JobId::from("j1"), ConversionParams::new("in.mkv", "out.mp4"));
        job.start();
        job
    }

    #[test]
    fn new_job_uses_defaults() {
        let job = Job::new(JobId::from("j1"), ConversionParams::new("in.mkv", "out.mp4"));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.params.quality, 23);
        assert_eq!(job.params.resolution, "720x480");
        assert_eq!(job.params.video_bitrate, 1000);
        assert_eq!(job.params.audio_bitrate, 96);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let mut job = running_job();
        assert!(job.record_progress(40.0));
        assert!(!job.record_progress(30.0));
        assert_eq!(job.progress, 40.0);
        assert!(job.record_progress(250.0));
        assert_eq!(job.progress, 100.0);
        assert!(!job.record_progress(f64::NAN));
    }

    #[test]
    fn progress_ignored_unless_running() {
        let mut job = Job::new(JobId::from("j1"), ConversionParams::new("a", "b"));
        assert!(!job.record_progress(10.0));
        assert_eq!(job.progress, 0.0);

        let mut done = running_job();
        done.complete();
        assert!(!done.record_progress(5.0));
        assert_eq!(done.progress, 100.0);
    }

    #[test]
    fn complete_sets_progress_and_timestamps() {
        let mut job = running_job();
        job.record_progress(50.0);
        job.complete();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
        assert!(job.is_terminal());
    }

    #[test]
    fn retry_cycle_keeps_first_start_time() {
        let mut job = running_job();
        let first_start = job.started_at;
        job.record_progress(60.0);

        assert!(job.can_retry());
        job.mark_retrying("exit code 1");
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.error_message.as_deref(), Some("exit code 1"));

        job.requeue();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);

        job.start();
        assert_eq!(job.started_at, first_start);
    }

    #[test]
    fn retries_exhaust_at_max() {
        let mut job = running_job().with_max_retries(2);
        job.mark_retrying("boom");
        job.mark_retrying("boom");
        assert!(!job.can_retry());
        job.fail("boom");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
    }

    #[test]
    fn status_text_round_trips() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("queued".parse::<JobStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&JobStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn resolution_parsing() {
        assert_eq!(parse_resolution("1280x720"), Some((1280, 720)));
        assert_eq!(parse_resolution("1920X1080"), Some((1920, 1080)));
        assert_eq!(parse_resolution(" 640 x 360 "), Some((640, 360)));
        assert_eq!(parse_resolution("1280"), None);
        assert_eq!(parse_resolution("0x720"), None);
        assert_eq!(parse_resolution("widexhigh"), None);
    }

    #[test]
    fn validation_rejects_bad_params() {
        let mut params = ConversionParams::new("in.mkv", "out.mp4");
        assert!(params.validate().is_ok());

        params.quality = 52;
        assert!(matches!(params.validate(), Err(Error::InvalidInput(_))));

        params.quality = 20;
        params.resolution = "hd".into();
        assert!(params.validate().is_err());

        let empty = ConversionParams::new("", "out.mp4");
        assert!(empty.validate().is_err());
    }

    #[test]
    fn submit_request_fills_defaults() {
        let defaults = JobDefaults::default();
        let mut request = SubmitRequest::new("/in/a.mkv", "/out/a.mp4");
        request.quality = Some(20);
        request.resolution = Some("1280x720".into());
        request.max_retries = Some(1);

        let job = request.into_job(&defaults).unwrap();
        assert_eq!(job.params.quality, 20);
        assert_eq!(job.params.resolution, "1280x720");
        assert_eq!(job.params.video_bitrate, 1000);
        assert_eq!(job.params.audio_bitrate, 96);
        assert_eq!(job.max_retries, 1);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn submit_request_keeps_caller_id() {
        let mut request = SubmitRequest::new("a", "b");
        request.job_id = Some("A".into());
        let job = request.into_job(&JobDefaults::default()).unwrap();
        assert_eq!(job.id.as_str(), "A");

        let mut blank = SubmitRequest::new("a", "b");
        blank.job_id = Some("  ".into());
        assert!(blank.into_job(&JobDefaults::default()).is_err());
    }

    #[test]
    fn submit_request_deserializes_with_optional_fields() {
        let request: SubmitRequest =
            serde_json::from_str(r#"{"input_path":"a.mkv","output_path":"b.mp4"}"#).unwrap();
        assert_eq!(request.quality, None);
        assert_eq!(request.job_id, None);
    }

    #[test]
    fn job_serializes_flat() {
        let job = Job::new(JobId::from("j1"), ConversionParams::new("a", "b"));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["id"], "j1");
        assert_eq!(value["input_path"], "a");
        assert_eq!(value["status"], "pending");
    }
}
