//! Still-frame capture from the camera's RTSP stream.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),
    #[error("capture {path} too small: {bytes} bytes")]
    TooSmall { path: PathBuf, bytes: u64 },
    #[error("frame grabber failed: {0}")]
    Failed(String),
    #[error("capture io: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces a still image of the camera's current view as a file.
#[async_trait]
pub trait FrameGrabber: Send + Sync {
    async fn grab(&self) -> Result<PathBuf, CaptureError>;
}

/// Limits applied around every grab.
#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    pub timeout: Duration,
    /// Smaller files are treated as failed captures.
    pub min_bytes: u64,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            min_bytes: 1000,
        }
    }
}

/// Grab one frame within `limits`. Too-small files are removed.
pub async fn capture_snapshot(
    grabber: &dyn FrameGrabber,
    limits: CaptureLimits,
) -> Result<PathBuf, CaptureError> {
    let path = tokio::time::timeout(limits.timeout, grabber.grab())
        .await
        .map_err(|_| CaptureError::Timeout(limits.timeout))??;

    let bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
    if bytes < limits.min_bytes {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!(path = %path.display(), error = %e, "could not remove short capture");
        }
        return Err(CaptureError::TooSmall { path, bytes });
    }

    Ok(path)
}

/// RTSP endpoint of the camera.
#[derive(Debug, Clone)]
pub struct RtspSource {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub stream_path: String,
}

impl RtspSource {
    pub fn url(&self) -> String {
        let auth = if self.user.is_empty() {
            String::new()
        } else {
            format!("{}:{}@", self.user, self.password)
        };
        format!(
            "rtsp://{auth}{}:{}/{}",
            self.host,
            self.port,
            self.stream_path.trim_start_matches('/')
        )
    }
}

/// Grabs frames by running `ffmpeg` against the RTSP stream.
///
/// The child is killed if the grab future is dropped, which is what
/// [`capture_snapshot`] does on timeout.
#[derive(Debug, Clone)]
pub struct FfmpegGrabber {
    source: RtspSource,
    snapshot_dir: PathBuf,
    program: PathBuf,
}

impl FfmpegGrabber {
    pub fn new(source: RtspSource, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            snapshot_dir: snapshot_dir.into(),
            program: PathBuf::from("ffmpeg"),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn next_snapshot_path(&self) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%6f");
        self.snapshot_dir.join(format!("snapshot_{stamp}.jpg"))
    }
}

#[async_trait]
impl FrameGrabber for FfmpegGrabber {
    async fn grab(&self) -> Result<PathBuf, CaptureError> {
        tokio::fs::create_dir_all(&self.snapshot_dir).await?;
        let path = self.next_snapshot_path();

        let status = Command::new(&self.program)
            .args(["-y", "-rtsp_transport", "tcp", "-i"])
            .arg(self.source.url())
            .args(["-frames:v", "1", "-update", "1"])
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;

        if !status.success() {
            return Err(CaptureError::Failed(format!("ffmpeg exited with {status}")));
        }

        Ok(path)
    }
}
