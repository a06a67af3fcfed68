//! Render hand-off.
//!
//! The engine decides when a clip renders; a `ClipEncoder` does the work on
//! its own thread. `RenderPolicy` decides what a failure means for the clip.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::clip::ClipId;
use crate::store::{frame_pattern, scan_frame_ids, video_path};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_BACKOFF_SHIFT: u32 = 16;

/// One request to turn a closed clip into a video.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderJob {
    pub clip: ClipId,
    pub output_dir: PathBuf,
    pub frame_rate: u32,
    /// 1-based attempt number for this clip.
    pub attempt: u32,
}

/// Result of a render job, delivered back to the worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderOutcome {
    pub clip: ClipId,
    pub attempt: u32,
    pub result: std::result::Result<PathBuf, String>,
}

impl RenderOutcome {
    pub fn from_result(job: &RenderJob, result: Result<PathBuf>) -> Self {
        Self {
            clip: job.clip.clone(),
            attempt: job.attempt,
            result: result.map_err(|e| format!("{:#}", e)),
        }
    }
}

/// Anything that can turn saved frames into a video file.
pub trait ClipEncoder: Send + Sync {
    fn encode(&self, job: &RenderJob) -> Result<PathBuf>;
}

/// Encoder backed by an external `ffmpeg` process.
#[derive(Clone, Debug)]
pub struct FfmpegEncoder {
    program: PathBuf,
    timeout: Duration,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn command(&self, job: &RenderJob, start_number: u32, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-hide_banner")
            .args(["-loglevel", "error"])
            .arg("-y")
            .arg("-framerate")
            .arg(job.frame_rate.to_string())
            .arg("-start_number")
            .arg(start_number.to_string())
            .arg("-i")
            .arg(frame_pattern(&job.output_dir, &job.clip))
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        cmd
    }
}

impl ClipEncoder for FfmpegEncoder {
    fn encode(&self, job: &RenderJob) -> Result<PathBuf> {
        let frame_ids = scan_frame_ids(&job.output_dir, &job.clip)?;
        let start_number = frame_ids
            .first()
            .copied()
            .ok_or_else(|| anyhow!("no saved JPEG frames for {}", job.clip))?;
        let output = video_path(&job.output_dir, &job.clip);

        let mut child = self
            .command(job, start_number, &output)
            .spawn()
            .with_context(|| format!("spawn {}", self.program.display()))?;

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().context("wait for encoder")? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!(
                    "encoder timed out after {:?} rendering {}",
                    self.timeout,
                    job.clip
                ));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            return Err(anyhow!("encoder exited with {} rendering {}", status, job.clip));
        }
        Ok(output)
    }
}

/// What a failed render means for its clip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureAction {
    /// Wait for a new frame or control event on the clip.
    Park,
    /// Dispatch again once the deadline passes.
    RetryAt(Instant),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RenderPolicy {
    /// A failed clip is dispatched again only when new activity touches it.
    #[default]
    Terminal,
    /// Retry on ticks with exponential backoff.
    Retry {
        max_attempts: u32,
        backoff: Duration,
    },
}

impl RenderPolicy {
    /// Build from a policy name plus retry parameters.
    pub fn from_parts(name: &str, max_attempts: u32, backoff: Duration) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "terminal" | "none" => Ok(Self::Terminal),
            "retry" | "backoff" => {
                if max_attempts == 0 {
                    return Err(anyhow!("render retry max_attempts must be at least 1"));
                }
                if backoff.is_zero() {
                    return Err(anyhow!("render retry backoff must be greater than zero"));
                }
                Ok(Self::Retry {
                    max_attempts,
                    backoff,
                })
            }
            other => Err(anyhow!(
                "unknown render policy '{}': expected 'terminal' or 'retry'",
                other
            )),
        }
    }

    /// Decide what happens after attempt number `attempts` failed.
    pub fn after_failure(&self, attempts: u32, now: Instant) -> FailureAction {
        match *self {
            Self::Terminal => FailureAction::Park,
            Self::Retry {
                max_attempts,
                backoff,
            } => {
                if attempts >= max_attempts {
                    return FailureAction::Park;
                }
                let shift = attempts.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
                let delay = backoff.saturating_mul(1u32 << shift);
                FailureAction::RetryAt(now + delay)
            }
        }
    }
}

impl fmt::Display for RenderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminal => write!(f, "terminal"),
            Self::Retry {
                max_attempts,
                backoff,
            } => write!(f, "retry(max {} attempts, backoff {:?})", max_attempts, backoff),
        }
    }
}
