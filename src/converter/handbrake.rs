//! HandBrakeCLI-backed converter.

use async_trait::async_trait;
use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transq_common::ConversionParams;

use super::{ConversionRequest, ConvertError, Converter, ProgressSender};

/// Wall-clock bound for one conversion: 1 hour.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Number of stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

const DEFAULT_BINARY: &str = "HandBrakeCLI";

/// Runs `HandBrakeCLI` with JSON progress output.
#[derive(Debug, Clone)]
pub struct HandbrakeConverter {
    binary: PathBuf,
    timeout: Duration,
    extra_args: Vec<String>,
}

impl Default for HandbrakeConverter {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

impl HandbrakeConverter {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_TIMEOUT,
            extra_args: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Arguments appended after the generated ones, e.g. an encoder preset.
    pub fn with_extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn program_name(&self) -> String {
        self.binary
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.binary.to_string_lossy().to_string())
    }

    /// Command line for `params`, without the program itself.
    pub fn build_args(&self, params: &ConversionParams) -> Result<Vec<String>, ConvertError> {
        let (width, height) = params.dimensions().ok_or_else(|| {
            ConvertError::InvalidParams(format!("bad resolution {:?}", params.resolution))
        })?;

        let mut args = vec![
            "-i".to_string(),
            params.input_path.clone(),
            "-o".to_string(),
            params.output_path.clone(),
            "-q".to_string(),
            params.quality.to_string(),
            "-w".to_string(),
            width.to_string(),
            "-l".to_string(),
            height.to_string(),
            "-b".to_string(),
            params.video_bitrate.to_string(),
            "-B".to_string(),
            params.audio_bitrate.to_string(),
            "--json".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        Ok(args)
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl Converter for HandbrakeConverter {
    async fn convert(
        &self,
        request: &ConversionRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<(), ConvertError> {
        let args = self.build_args(&request.params)?;

        if let Some(parent) = Path::new(&request.params.output_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let program = self.program_name();
        debug!(job_id = %request.job_id, program = %program, ?args, "Starting conversion");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ConvertError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_tail(stderr, STDERR_TAIL_LINES)));
        let stdout = child.stdout.take();

        let outcome = {
            let run = async {
                let forwarded = match stdout {
                    Some(stdout) => forward_progress(stdout, &progress).await,
                    None => Ok(()),
                };
                let status = child.wait().await;
                forwarded.and(status)
            };

            tokio::select! {
                result = tokio::time::timeout(self.timeout, run) => match result {
                    Ok(status) => Outcome::Exited(status),
                    Err(_) => Outcome::TimedOut,
                },
                _ = cancel.cancelled() => Outcome::Cancelled,
            }
        };

        match outcome {
            Outcome::Exited(status) => {
                let status = status?;
                let stderr = match stderr_tail {
                    Some(handle) => handle.await.unwrap_or_default(),
                    None => String::new(),
                };
                if status.success() {
                    info!(job_id = %request.job_id, "Conversion finished");
                    Ok(())
                } else {
                    Err(ConvertError::Exited {
                        code: status.code(),
                        stderr,
                    })
                }
            }
            Outcome::TimedOut => {
                warn!(job_id = %request.job_id, timeout_secs = self.timeout.as_secs(), "Conversion timed out, killing {program}");
                kill(&mut child, &program).await;
                abort_tail(stderr_tail);
                Err(ConvertError::TimedOut(self.timeout))
            }
            Outcome::Cancelled => {
                info!(job_id = %request.job_id, "Conversion cancelled, killing {program}");
                kill(&mut child, &program).await;
                abort_tail(stderr_tail);
                Err(ConvertError::Cancelled)
            }
        }
    }
}

async fn kill(child: &mut Child, program: &str) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill {program}");
    }
}

fn abort_tail(handle: Option<tokio::task::JoinHandle<String>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}

/// Split complete `\n`- or `\r`-terminated segments off the front of `buf`.
///
/// HandBrake redraws its text progress line with carriage returns, so both
/// count as terminators. Blank segments are dropped.
fn take_segments(buf: &mut Vec<u8>) -> Vec<String> {
    let mut segments = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n' || b == b'\r') {
        let segment: Vec<u8> = buf.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&segment[..pos]);
        if !text.trim().is_empty() {
            segments.push(text.into_owned());
        }
    }
    segments
}

/// Feed every output segment of `reader` to `on_segment` until EOF.
async fn read_segments<R, F>(mut reader: R, mut on_segment: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..n]);
        take_segments(&mut pending).into_iter().for_each(&mut on_segment);
    }
    let rest = String::from_utf8_lossy(&pending);
    if !rest.trim().is_empty() {
        on_segment(rest.into_owned());
    }
    Ok(())
}

async fn forward_progress<R: AsyncRead + Unpin>(
    reader: R,
    progress: &ProgressSender,
) -> std::io::Result<()> {
    read_segments(reader, |line| {
        if let Some(fraction) = parse_progress(&line) {
            // The receiver only goes away once the scheduler stopped caring.
            let _ = progress.send(fraction);
        }
    })
    .await
}

async fn read_tail<R: AsyncRead + Unpin>(reader: R, max_lines: usize) -> String {
    let mut tail = VecDeque::with_capacity(max_lines);
    let result = read_segments(reader, |line| {
        if tail.len() == max_lines {
            tail.pop_front();
        }
        tail.push_back(line);
    })
    .await;
    if let Err(e) = result {
        debug!(error = %e, "Stopped reading converter stderr");
    }
    Vec::from(tail).join("\n")
}

fn json_progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#""Progress"\s*:\s*([0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)"#)
            .expect("JSON progress pattern is valid")
    })
}

fn text_progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Encoding: task \d+ of \d+, ([0-9]+(?:\.[0-9]+)?) ?%")
            .expect("text progress pattern is valid")
    })
}

/// Extract a progress fraction from one line of HandBrake output.
///
/// Understands the `--json` form (`"Progress": 0.42`, already a fraction)
/// and the plain-text form (`Encoding: task 1 of 1, 42.00 %`).
pub fn parse_progress(line: &str) -> Option<f64> {
    if let Some(caps) = json_progress_pattern().captures(line) {
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        return Some(value.clamp(0.0, 1.0));
    }
    if let Some(caps) = text_progress_pattern().captures(line) {
        let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
        return Some((percent / 100.0).clamp(0.0, 1.0));
    }
    None
}
