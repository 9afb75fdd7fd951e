//! The transcoder boundary.
//!
//! The scheduler hands a [`ConversionRequest`] to a [`Converter`] and gets
//! back success or a [`ConvertError`]. Progress flows the other way as
//! fractions in `0.0..=1.0` over a [`ProgressSender`]. [`HandbrakeConverter`]
//! is the production implementation; tests substitute scripted converters.

mod handbrake;

pub use handbrake::{parse_progress, HandbrakeConverter, DEFAULT_TIMEOUT};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use transq_common::{ConversionParams, Job, JobId};

/// Channel carrying fractional progress (0.0 to 1.0) from a converter.
pub type ProgressSender = mpsc::UnboundedSender<f64>;

/// Receiving side of a [`ProgressSender`].
pub type ProgressReceiver = mpsc::UnboundedReceiver<f64>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// What to convert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub job_id: JobId,
    pub params: ConversionParams,
}

impl From<&Job> for ConversionRequest {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            params: job.params.clone(),
        }
    }
}

/// Why a conversion attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{}", exited_message(.code, .stderr))]
    Exited { code: Option<i32>, stderr: String },

    #[error("conversion timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("conversion cancelled")]
    Cancelled,

    #[error("invalid conversion parameters: {0}")]
    InvalidParams(String),

    #[error("I/O error during conversion: {0}")]
    Io(#[from] std::io::Error),
}

fn exited_message(code: &Option<i32>, stderr: &str) -> String {
    let status = match code {
        Some(code) => format!("converter exited with code {code}"),
        None => "converter was terminated by a signal".to_string(),
    };
    let stderr = stderr.trim();
    if stderr.is_empty() {
        status
    } else {
        format!("{status}: {stderr}")
    }
}

/// Runs one conversion attempt.
///
/// Implementations send progress fractions as they learn them, stop early
/// when `cancel` fires, and must not outlive their own wall-clock bound.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(
        &self,
        request: &ConversionRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<(), ConvertError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exited_error_includes_stderr_tail() {
        let err = ConvertError::Exited {
            code: Some(3),
            stderr: "  No title found\n".into(),
        };
        assert_eq!(err.to_string(), "converter exited with code 3: No title found");

        let err = ConvertError::Exited {
            code: None,
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "converter was terminated by a signal");
    }

    #[test]
    fn timeout_message_names_duration() {
        let err = ConvertError::TimedOut(Duration::from_secs(3600));
        assert_eq!(err.to_string(), "conversion timed out after 3600s");
    }

    #[test]
    fn request_from_job() {
        let job = Job::new(JobId::from("a"), ConversionParams::new("in.mkv", "out.mp4"));
        let request = ConversionRequest::from(&job);
        assert_eq!(request.job_id, job.id);
        assert_eq!(request.params, job.params);
    }
}
