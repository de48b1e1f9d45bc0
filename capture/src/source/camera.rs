use async_trait::async_trait;
use frame_verdict_common::config::SourceConfig;
use frame_verdict_common::frame::Still;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::mjpeg::MjpegSplitter;
use super::still::{encode_still, is_displayable};
use super::{FrameSource, LatestImage, SourceError, SourceStatus};

const BOUNDARY_TAG: &str = "frame";
const FALLBACK_SIDE: u32 = 1080;

/// A local capture device read through an `ffmpeg` child process.
///
/// ffmpeg centre-crops every frame to a square, scales it to the configured
/// still size and writes a multipart JPEG stream to stdout, which is split
/// the same way a remote MJPEG feed is.
pub struct LocalCamera {
    config: SourceConfig,
    program: String,
    latest: LatestImage,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
}

impl LocalCamera {
    pub fn new(config: SourceConfig) -> Self {
        Self::with_program(config, "ffmpeg")
    }

    /// Use a specific ffmpeg binary instead of the one on PATH.
    pub fn with_program(config: SourceConfig, program: impl Into<String>) -> Self {
        Self {
            config,
            program: program.into(),
            latest: LatestImage::new(),
            child: None,
            reader: None,
        }
    }

    fn still_size(&self) -> (u32, u32) {
        self.config
            .still_size()
            .unwrap_or((FALLBACK_SIDE, FALLBACK_SIDE))
    }

    fn ffmpeg_args(&self) -> Vec<String> {
        let (width, height) = self.still_size();
        let filter = format!("crop='min(iw,ih)':'min(iw,ih)',scale={width}:{height}");
        let qscale = mjpeg_qscale(self.config.jpeg_quality).to_string();
        let args: [&str; 16] = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            &self.config.input_format,
            "-i",
            &self.config.device,
            "-vf",
            &filter,
            "-q:v",
            &qscale,
            "-f",
            "mpjpeg",
            "-boundary_tag",
            BOUNDARY_TAG,
            "pipe:1",
        ];
        args.iter().map(|s| s.to_string()).collect()
    }

    async fn release(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "camera process already gone");
            }
        }
    }
}

#[async_trait]
impl FrameSource for LocalCamera {
    async fn open(&mut self) -> Result<(), SourceError> {
        self.release().await;

        let args = self.ffmpeg_args();
        debug!(program = %self.program, ?args, "spawning camera process");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SourceError::Unavailable(format!("failed to spawn {}: {e}", self.program))
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            return Err(SourceError::Unavailable(
                "could not get camera process pipes".into(),
            ));
        };

        self.latest.set_status(SourceStatus::Connecting);
        self.reader = Some(tokio::spawn(read_camera(stdout, stderr, self.latest.clone())));
        self.child = Some(child);

        match self.latest.wait_ready(self.config.open_timeout()).await {
            Ok(()) => {
                let (width, height) = self.still_size();
                info!(device = %self.config.device, width, height, "camera ready");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, device = %self.config.device, "camera failed to open");
                self.release().await;
                self.latest.set_status(SourceStatus::Unavailable(e.to_string()));
                Err(e)
            }
        }
    }

    fn snapshot(&mut self) -> Result<Still, SourceError> {
        let jpeg = self.latest.current().ok_or(SourceError::NotReady)?;
        encode_still(&jpeg, Some(self.still_size()), self.config.jpeg_quality)
    }

    async fn close(&mut self) {
        self.release().await;
        self.latest.set_status(SourceStatus::Closed);
        debug!(device = %self.config.device, "camera closed");
    }

    fn status(&self) -> watch::Receiver<SourceStatus> {
        self.latest.status()
    }

    fn name(&self) -> &str {
        "camera"
    }
}

impl Drop for LocalCamera {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Pump ffmpeg's stdout into the latest-image slot until the process exits.
async fn read_camera(mut stdout: ChildStdout, stderr: ChildStderr, latest: LatestImage) {
    let mut splitter = MjpegSplitter::new(BOUNDARY_TAG);
    let mut lines = BufReader::new(stderr).lines();
    let mut stderr_open = true;
    let mut last_error = String::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    for jpeg in splitter.push(&buf[..n]) {
                        if is_displayable(&jpeg) {
                            latest.publish(jpeg);
                        }
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            },
            line = lines.next_line(), if stderr_open => match line {
                Ok(Some(line)) => {
                    debug!(line, "ffmpeg");
                    last_error = line;
                }
                _ => stderr_open = false,
            },
        }
    }

    let reason = if last_error.is_empty() {
        "camera process exited".to_string()
    } else {
        last_error
    };
    warn!(reason, "camera feed ended");
    latest.set_status(SourceStatus::Unavailable(reason));
}

/// Map a 1..=100 JPEG quality onto ffmpeg's 2..=31 MJPEG qscale (lower is better).
fn mjpeg_qscale(quality: u8) -> u8 {
    let quality = quality.clamp(1, 100) as u32;
    (2 + (100 - quality) * 29 / 99) as u8
}

/// Check whether ffmpeg is available on PATH. Logs a warning if not found.
pub async fn check_ffmpeg_available() {
    match Command::new("ffmpeg").arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!("ffmpeg is available");
        }
        Ok(_) => {
            warn!("ffmpeg returned non-zero for -version; camera capture may fail");
        }
        Err(e) => {
            warn!(
                error = %e,
                "ffmpeg not found on PATH; the camera source cannot open. \
                 Install ffmpeg with v4l2/avfoundation input support."
            );
        }
    }
}
