//! Transcoding subprocess.
//!
//! Motion analysis and recording both feed Annex-B H.264 into an external
//! transcoder (ffmpeg) over its stdin:
//!
//! ```text
//! motion:    <cmd> -f h264 -i - -vf scale=320:240,edgedetect \
//!                  -vcodec rawvideo -pix_fmt gray -f rawvideo -
//! recording: <cmd> -f h264 -r 10 -framerate 10 -i - -r 10 -framerate 10 <file>
//! ```
//!
//! `<cmd>` is the configured command prefix, e.g. `ffmpeg` or
//! `docker exec -i toolbox ffmpeg`. An empty prefix disables both paths.

use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{NvrError, Result};

const MOTION_ARGS: &[&str] = &[
    "-f",
    "h264",
    "-i",
    "-",
    "-vf",
    "scale=320:240,edgedetect",
    "-vcodec",
    "rawvideo",
    "-pix_fmt",
    "gray",
    "-f",
    "rawvideo",
    "-",
];

const RECORDING_ARGS: &[&str] = &[
    "-f",
    "h264",
    "-r",
    "10",
    "-framerate",
    "10",
    "-i",
    "-",
    "-r",
    "10",
    "-framerate",
    "10",
];

/// Configured transcoder command.
#[derive(Debug, Clone, Default)]
pub struct Transcoder {
    command: Vec<String>,
    debug: bool,
}

impl Transcoder {
    /// `command` is the program followed by its leading arguments.
    /// With `debug`, the subprocess inherits our stderr.
    pub fn new(command: Vec<String>, debug: bool) -> Self {
        Self { command, debug }
    }

    pub fn is_enabled(&self) -> bool {
        !self.command.is_empty()
    }

    /// Start the motion transcoder: Annex-B in, 320×240 gray frames out.
    pub fn spawn_motion(&self) -> Result<TranscoderProcess> {
        let args = MOTION_ARGS.iter().map(OsString::from).collect();
        self.spawn("motion", args, true)
    }

    /// Start a recording transcoder writing to `path`.
    pub fn spawn_recording(&self, path: &Path) -> Result<TranscoderProcess> {
        let mut args: Vec<OsString> = RECORDING_ARGS.iter().map(OsString::from).collect();
        args.push(path.as_os_str().to_owned());
        self.spawn("recording", args, false)
    }

    fn spawn(
        &self,
        role: &'static str,
        args: Vec<OsString>,
        capture_stdout: bool,
    ) -> Result<TranscoderProcess> {
        let (program, prefix) = self
            .command
            .split_first()
            .ok_or(NvrError::TranscoderDisabled)?;

        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(if capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(if self.debug {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        tracing::debug!(role, %program, pid = ?child.id(), "transcoder started");

        Ok(TranscoderProcess {
            role,
            child,
            stdin,
            stdout,
            exited: None,
        })
    }
}

/// A running transcoder. Killed when dropped.
#[derive(Debug)]
pub struct TranscoderProcess {
    role: &'static str,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    exited: Option<ExitStatus>,
}

impl TranscoderProcess {
    /// Take ownership of the stdin pipe.
    pub fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.stdin.take().ok_or(NvrError::PipeUnavailable("stdin"))
    }

    /// Take ownership of the stdout pipe.
    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.stdout.take().ok_or(NvrError::PipeUnavailable("stdout"))
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exited {
            return Ok(status);
        }
        // Close our end of stdin first, or a child reading it never exits.
        self.stdin = None;
        let status = self.child.wait().await?;
        self.exited = Some(status);
        tracing::debug!(role = self.role, %status, "transcoder exited");
        Ok(status)
    }

    /// Wait up to `grace` for the process to exit on its own, then kill it.
    pub async fn wait_or_kill(&mut self, grace: Duration) -> Result<ExitStatus> {
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(role = self.role, ?grace, "transcoder did not exit, killing");
                self.stop().await
            }
        }
    }

    /// Kill the process and reap it. Safe to call more than once.
    pub async fn stop(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exited {
            return Ok(status);
        }
        self.stdin = None;
        self.stdout = None;
        if let Err(e) = self.child.start_kill() {
            // Already exited; wait() below reaps it.
            tracing::trace!(role = self.role, error = %e, "kill failed");
        }
        self.wait().await
    }
}
