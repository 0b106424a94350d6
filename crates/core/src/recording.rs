//! Time-bounded clip recording.
//!
//! A recording session owns one recording transcoder for its lifetime:
//!
//! ```text
//!  ingest ──RecordingHandle──► mpsc ──► session task ──stdin──► transcoder ──► file
//! ```
//!
//! Ingest reaches the session only through the camera's recording sink. The
//! session ends when its duration elapses, when a write into the transcoder
//! fails, or when the camera is cancelled. In every case the sink is reset
//! first, then the pipe is closed and the process reaped.
//!
//! Files are laid out as `<root>/<YYYY-MM-DD>/<HHMMSS>-<camera>.mp4` using
//! local time; date directories are created owner-only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::camera::{Camera, RecordingHandle};
use crate::error::Result;
use crate::motion::ClipRecorder;
use crate::transcode::{Transcoder, TranscoderProcess};

/// How long a finished recording may take to flush before it is killed.
pub const FINISH_GRACE: Duration = Duration::from_secs(5);

/// Access units buffered between ingest and the transcoder.
const FRAME_QUEUE: usize = 64;

/// Global session counter, unique across cameras.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Starts recording sessions for any camera.
pub struct RecordingManager {
    root: PathBuf,
    transcoder: Transcoder,
}

impl RecordingManager {
    pub fn new(root: impl Into<PathBuf>, transcoder: Transcoder) -> Self {
        Self {
            root: root.into(),
            transcoder,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start recording `camera` for `duration`.
    ///
    /// Returns the session number, or `None` when no transcoder is
    /// configured. On error the camera's sink is left untouched.
    pub async fn try_start(
        &self,
        camera: &Arc<Camera>,
        duration: Duration,
    ) -> Result<Option<u64>> {
        if !self.transcoder.is_enabled() {
            tracing::debug!(camera = %camera.id(), "transcoder disabled, not recording");
            return Ok(None);
        }

        let path = recording_path(&self.root, camera.id(), Local::now());
        if let Some(dir) = path.parent() {
            create_private_dir(dir).await?;
        }

        let mut process = self.transcoder.spawn_recording(&path)?;
        let stdin = process.take_stdin()?;

        let session_id = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(FRAME_QUEUE);
        camera.set_recording(RecordingHandle::new(session_id, tx));

        tracing::info!(
            camera = %camera.id(),
            session = session_id,
            path = %path.display(),
            ?duration,
            "recording started"
        );

        let session = RecordingSession {
            camera: camera.clone(),
            session_id,
            path,
            process,
            stdin,
            frames: rx,
        };
        tokio::spawn(session.run(duration, camera.cancel_token().clone()));

        Ok(Some(session_id))
    }
}

#[async_trait]
impl ClipRecorder for RecordingManager {
    async fn start(&self, camera: &Arc<Camera>, duration: Duration) {
        if let Err(e) = self.try_start(camera, duration).await {
            tracing::warn!(
                camera = %camera.id(),
                root = %self.root.display(),
                error = %e,
                "could not start recording"
            );
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Elapsed,
    WriteFailed,
    Cancelled,
}

struct RecordingSession {
    camera: Arc<Camera>,
    session_id: u64,
    path: PathBuf,
    process: TranscoderProcess,
    stdin: ChildStdin,
    frames: mpsc::Receiver<Bytes>,
}

impl RecordingSession {
    async fn run(mut self, duration: Duration, cancel: CancellationToken) {
        let end = self.pump(duration, &cancel).await;

        self.camera.clear_recording(self.session_id);
        let Self {
            camera,
            session_id,
            path,
            mut process,
            stdin,
            frames,
        } = self;
        drop(frames);
        drop(stdin);

        let finished = match end {
            SessionEnd::Cancelled => process.stop().await,
            SessionEnd::Elapsed | SessionEnd::WriteFailed => {
                process.wait_or_kill(FINISH_GRACE).await
            }
        };

        match finished {
            Ok(status) if status.success() || end == SessionEnd::Cancelled => {
                tracing::info!(
                    camera = %camera.id(),
                    session = session_id,
                    path = %path.display(),
                    ?end,
                    "recording finished"
                );
            }
            Ok(status) => {
                tracing::warn!(
                    camera = %camera.id(),
                    session = session_id,
                    path = %path.display(),
                    %status,
                    "error finishing recording"
                );
            }
            Err(e) => {
                tracing::warn!(
                    camera = %camera.id(),
                    session = session_id,
                    path = %path.display(),
                    error = %e,
                    "error finishing recording"
                );
            }
        }
    }

    /// Copy frames into the transcoder until the session should end.
    async fn pump(&mut self, duration: Duration, cancel: &CancellationToken) -> SessionEnd {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                _ = &mut deadline => return SessionEnd::Elapsed,
                frame = self.frames.recv() => frame,
            };
            // The camera holds a sender for as long as the sink is ours.
            let Some(frame) = frame else {
                return SessionEnd::Elapsed;
            };

            let write = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                write = self.stdin.write_all(&frame) => write,
            };
            if let Err(e) = write {
                tracing::warn!(
                    camera = %self.camera.id(),
                    session = self.session_id,
                    error = %e,
                    "can not write frame to recording"
                );
                return SessionEnd::WriteFailed;
            }
        }
    }
}

/// `<root>/<YYYY-MM-DD>/<HHMMSS>-<id>.mp4`
pub fn recording_path(root: &Path, camera_id: &str, now: DateTime<Local>) -> PathBuf {
    root.join(now.format("%Y-%m-%d").to_string())
        .join(format!("{}-{camera_id}.mp4", now.format("%H%M%S")))
}

async fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await?;
    Ok(())
}
