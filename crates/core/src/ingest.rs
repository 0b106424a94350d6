//! Per-camera RTSP ingest.
//!
//! Each camera runs one unbounded state machine:
//!
//! ```text
//!        ┌────────────┐  play ok   ┌───────────┐
//!   ┌───►│ Connecting │──────────►│ Streaming │
//!   │    └────────────┘            └───────────┘
//!   │          │ error                   │ read/write error, end of stream
//!   │          ▼                         ▼
//!   │    ┌──────────────────────────────────┐
//!   └────│         Cooldown (10 s)          │
//!        └──────────────────────────────────┘
//! ```
//!
//! Cancelling the camera's token stops the machine in any state.
//!
//! On entering Streaming the motion transcoder is started (when the camera
//! has a threshold and recording is enabled) under a per-cycle child token,
//! so leaving Streaming tears down the transcoder and its detector.
//!
//! Every access unit is converted to Annex-B, prefixed with
//! `startcode SPS startcode PPS startcode`, and written in order to the
//! motion transcoder, the active recording sink, and the live track.

use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use retina::client::{
    Credentials, Demuxed, PlayOptions, Session, SessionGroup, SessionOptions, SetupOptions,
};
use retina::codec::{CodecItem, ParametersRef};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio_util::sync::CancellationToken;
use url::Url;
use webrtc::media::Sample;

use crate::camera::{Camera, RecordingSink};
use crate::error::{NvrError, Result};
use crate::media::h264::START_CODE;
use crate::media::{ParameterSets, access_unit_to_annexb};
use crate::motion::{ClipRecorder, MotionDetector};
use crate::transcode::{Transcoder, TranscoderProcess};

/// Pause between a failed or ended stream and the next connection attempt.
pub const COOLDOWN: Duration = Duration::from_secs(10);

const USER_AGENT: &str = concat!("nvr-rs/", env!("CARGO_PKG_VERSION"));

/// Ingest state. Streaming carries the open camera session.
pub enum IngestState {
    Connecting,
    Streaming(Box<CameraStream>),
    Cooldown,
}

impl IngestState {
    fn name(&self) -> &'static str {
        match self {
            IngestState::Connecting => "connecting",
            IngestState::Streaming(_) => "streaming",
            IngestState::Cooldown => "cooldown",
        }
    }
}

/// A playing camera session.
pub struct CameraStream {
    session: Pin<Box<Demuxed>>,
    /// Annex-B prefix built from the current parameter sets.
    prefix: Option<Bytes>,
}

/// The motion transcoder of one Streaming cycle.
struct MotionPipeline {
    process: TranscoderProcess,
    input: ChildStdin,
}

/// Ingest loop for one camera.
pub struct Ingest {
    camera: Arc<Camera>,
    transcoder: Transcoder,
    recorder: Arc<dyn ClipRecorder>,
    session_group: Arc<SessionGroup>,
    cooldown: Duration,
    /// A motion transcoder start failure was logged and no start has
    /// succeeded since.
    motion_failure_reported: bool,
}

impl Ingest {
    pub fn new(camera: Arc<Camera>, transcoder: Transcoder, recorder: Arc<dyn ClipRecorder>) -> Self {
        Self {
            camera,
            transcoder,
            recorder,
            session_group: Arc::new(SessionGroup::default()),
            cooldown: COOLDOWN,
            motion_failure_reported: false,
        }
    }

    /// Override the reconnect pause.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Run until the camera is cancelled.
    pub async fn run(mut self) {
        let cancel = self.camera.cancel_token().clone();
        let mut state = IngestState::Connecting;

        loop {
            state = match state {
                IngestState::Connecting => {
                    let connect = tokio::select! {
                        _ = cancel.cancelled() => break,
                        connect = self.connect() => connect,
                    };
                    match connect {
                        Ok(stream) => {
                            tracing::info!(camera = %self.camera.id(), "camera stream playing");
                            IngestState::Streaming(Box::new(stream))
                        }
                        Err(e) => {
                            tracing::warn!(
                                camera = %self.camera.id(),
                                error = %e,
                                "can not connect to camera"
                            );
                            IngestState::Cooldown
                        }
                    }
                }
                IngestState::Streaming(stream) => {
                    match self.stream(*stream, &cancel).await {
                        Ok(reason) => {
                            tracing::info!(camera = %self.camera.id(), reason, "camera stream ended");
                        }
                        Err(e) => {
                            tracing::warn!(
                                camera = %self.camera.id(),
                                error = %e,
                                "camera stream failed"
                            );
                        }
                    }
                    IngestState::Cooldown
                }
                IngestState::Cooldown => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.cooldown) => IngestState::Connecting,
                    }
                }
            };
            if cancel.is_cancelled() {
                break;
            }
            tracing::debug!(camera = %self.camera.id(), state = state.name(), "ingest state");
        }

        tracing::info!(camera = %self.camera.id(), "ingest stopped");
    }

    /// DESCRIBE, SETUP the first stream, PLAY.
    async fn connect(&self) -> Result<CameraStream> {
        let (url, creds) = split_credentials(self.camera.url())?;
        tracing::debug!(camera = %self.camera.id(), %url, "connecting");

        let mut session = Session::describe(
            url,
            SessionOptions::default()
                .creds(creds)
                .session_group(self.session_group.clone())
                .user_agent(USER_AGENT.to_string()),
        )
        .await?;

        let first = session
            .streams()
            .first()
            .ok_or_else(|| NvrError::StreamUnusable("no streams".to_string()))?;
        if first.media() != "video" || !first.encoding_name().eq_ignore_ascii_case("h264") {
            return Err(NvrError::StreamUnusable(format!(
                "first stream is {}/{}",
                first.media(),
                first.encoding_name()
            )));
        }
        let prefix = match first.parameters() {
            Some(ParametersRef::Video(params)) => {
                ParameterSets::from_avc_decoder_config(params.extra_data())
                    .ok()
                    .map(|p| p.annexb_prefix())
            }
            _ => None,
        };
        if prefix.is_none() {
            tracing::debug!(camera = %self.camera.id(), "no SPS/PPS in description, waiting for in-band parameters");
        }

        session.setup(0, SetupOptions::default()).await?;
        let session = session.play(PlayOptions::default()).await?.demuxed()?;

        Ok(CameraStream {
            session: Box::pin(session),
            prefix,
        })
    }

    /// Copy frames until the stream ends, a write fails, or `cancel` fires.
    async fn stream(
        &mut self,
        mut stream: CameraStream,
        cancel: &CancellationToken,
    ) -> Result<&'static str> {
        let cycle = cancel.child_token();
        let mut motion = self.start_motion(&cycle);
        // Presentation time of the previous sample in this cycle.
        let mut last_pts: Option<i64> = None;

        let result = loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break Ok("cancelled"),
                item = stream.session.next() => item,
            };
            let frame = match item {
                None => break Ok("end of stream"),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(CodecItem::VideoFrame(frame))) => frame,
                Some(Ok(_)) => continue,
            };
            if frame.stream_id() != 0 {
                continue;
            }

            if frame.has_new_parameters() {
                stream.refresh_prefix();
            }
            if stream.prefix.is_none() {
                stream.capture_inband_prefix(frame.data());
            }
            let Some(prefix) = &stream.prefix else {
                tracing::trace!(camera = %self.camera.id(), "frame skipped, no parameters yet");
                continue;
            };

            let access_unit = access_unit_to_annexb(prefix, frame.data());
            let timestamp = frame.timestamp();
            let duration = sample_duration(last_pts, timestamp.elapsed(), timestamp.clock_rate());
            last_pts = Some(timestamp.elapsed());

            let input = motion.as_mut().map(|m| &mut m.input);
            if let Err(e) = self.write_frame(access_unit, duration, input).await {
                break Err(e);
            }
            if cancel.is_cancelled() {
                break Ok("cancelled");
            }
        };

        cycle.cancel();
        if let Some(mut pipeline) = motion {
            drop(pipeline.input);
            if let Err(e) = pipeline.process.stop().await {
                tracing::debug!(camera = %self.camera.id(), error = %e, "motion transcoder stop failed");
            }
        }
        result
    }

    /// Start the motion transcoder and its detector for one cycle.
    fn start_motion(&mut self, cycle: &CancellationToken) -> Option<MotionPipeline> {
        if !self.camera.motion_enabled() {
            return None;
        }

        let spawned = self.transcoder.spawn_motion().and_then(|mut process| {
            let input = process.take_stdin()?;
            let output = process.take_stdout()?;
            Ok((process, input, output))
        });
        let (process, input, output) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                if !self.motion_failure_reported {
                    tracing::warn!(
                        camera = %self.camera.id(),
                        error = %e,
                        "could not start motion transcoder"
                    );
                    self.motion_failure_reported = true;
                }
                return None;
            }
        };
        self.motion_failure_reported = false;

        let detector = MotionDetector::new(self.camera.clone(), output, self.recorder.clone());
        let camera_id = self.camera.id().to_string();
        let token = cycle.clone();
        tokio::spawn(async move {
            let reason = detector.run(token).await;
            tracing::debug!(camera = %camera_id, reason, "motion detector stopped");
        });

        Some(MotionPipeline { process, input })
    }

    /// Deliver one access unit to the motion transcoder, the recording sink
    /// and the live track, in that order.
    ///
    /// Returns early, without error, once the camera is cancelled, even if a
    /// consumer has stopped reading.
    async fn write_frame<W>(
        &self,
        access_unit: Bytes,
        duration: Duration,
        motion: Option<&mut W>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        tokio::select! {
            biased;
            _ = self.camera.cancel_token().cancelled() => Ok(()),
            delivered = self.deliver(access_unit, duration, motion) => delivered,
        }
    }

    async fn deliver<W>(
        &self,
        access_unit: Bytes,
        duration: Duration,
        motion: Option<&mut W>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(input) = motion {
            input.write_all(&access_unit).await?;
        }

        if let RecordingSink::Recording(handle) = self.camera.recording_sink() {
            if !handle.write(access_unit.clone()).await {
                tracing::trace!(
                    camera = %self.camera.id(),
                    session = handle.session_id(),
                    "recording session already ended"
                );
            }
        }

        let sample = Sample {
            data: access_unit,
            duration,
            ..Default::default()
        };
        match self.camera.track().write_sample(&sample).await {
            Ok(()) | Err(webrtc::Error::ErrClosedPipe) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl CameraStream {
    fn refresh_prefix(&mut self) {
        let params = match self.session.streams().first().and_then(|s| s.parameters()) {
            Some(ParametersRef::Video(params)) => params.extra_data().to_vec(),
            _ => return,
        };
        match ParameterSets::from_avc_decoder_config(&params) {
            Ok(sets) => {
                tracing::debug!(sps = sets.sps.len(), pps = sets.pps.len(), "parameter sets changed");
                self.prefix = Some(sets.annexb_prefix());
            }
            Err(e) => tracing::debug!(error = %e, "unusable parameter sets"),
        }
    }

    /// Look for SPS/PPS carried inside the access unit itself.
    fn capture_inband_prefix(&mut self, avcc: &[u8]) {
        let annexb = access_unit_to_annexb(&START_CODE, avcc);
        if let Some(sets) = ParameterSets::from_annexb(&annexb) {
            tracing::debug!("parameter sets captured from bitstream");
            self.prefix = Some(sets.annexb_prefix());
        }
    }
}

/// Duration of a sample given the previous presentation time.
///
/// The first sample of a cycle, and a sample whose timestamp went backwards,
/// get zero duration.
pub fn sample_duration(previous: Option<i64>, now: i64, clock_rate: NonZeroU32) -> Duration {
    match previous {
        Some(prev) if now >= prev => {
            let ticks = (now - prev) as u128;
            let nanos = ticks * 1_000_000_000 / u128::from(clock_rate.get());
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
        _ => Duration::ZERO,
    }
}

/// Remove user info from `url`, returning it as explicit credentials.
pub fn split_credentials(url: &Url) -> Result<(Url, Option<Credentials>)> {
    if url.username().is_empty() && url.password().is_none() {
        return Ok((url.clone(), None));
    }
    let username = percent_decode_str(url.username()).decode_utf8_lossy().into_owned();
    let password = percent_decode_str(url.password().unwrap_or(""))
        .decode_utf8_lossy()
        .into_owned();

    let mut bare = url.clone();
    let invalid = || NvrError::InvalidCameraUrl {
        url: url.to_string(),
        reason: "can not strip credentials".to_string(),
    };
    bare.set_username("").map_err(|_| invalid())?;
    bare.set_password(None).map_err(|_| invalid())?;
    Ok((bare, Some(Credentials { username, password })))
}
