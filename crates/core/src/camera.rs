//! Per-camera shared state.
//!
//! A [`Camera`] is created once at startup and shared (`Arc`) by every task
//! working on that camera: ingest, motion detection, recording sessions,
//! telemetry broadcast, viewer negotiation and the RTSP proxy.
//!
//! Immutable attributes are plain fields. The three mutable values live in
//! one [`CameraState`] behind a single `parking_lot::RwLock`:
//!
//! | field | writers | readers |
//! |-------|---------|---------|
//! | `recording` | recording start/stop | ingest per packet, motion detector |
//! | `channels` | viewer negotiation, broadcast pruning | broadcast |
//! | `motion` | motion detector | broadcast |
//!
//! The lock is only held to read or swap in-memory values, never across an
//! `.await`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::acl::AccessList;
use crate::error::Result;

/// Where ingested access units go for recording.
#[derive(Debug, Clone, Default)]
pub enum RecordingSink {
    /// No recording session is active.
    #[default]
    NotRecording,
    /// A recording session is accepting frames.
    Recording(RecordingHandle),
}

impl RecordingSink {
    pub fn is_recording(&self) -> bool {
        matches!(self, RecordingSink::Recording(_))
    }

    /// Session number of the active recording, if any.
    pub fn session_id(&self) -> Option<u64> {
        match self {
            RecordingSink::Recording(handle) => Some(handle.session_id),
            RecordingSink::NotRecording => None,
        }
    }
}

/// Sending half of an active recording session.
///
/// The session task owns the subprocess stdin; frames reach it through this
/// bounded channel. Cloning the handle does not extend the session.
#[derive(Debug, Clone)]
pub struct RecordingHandle {
    session_id: u64,
    frames: mpsc::Sender<Bytes>,
}

impl RecordingHandle {
    pub fn new(session_id: u64, frames: mpsc::Sender<Bytes>) -> Self {
        Self { session_id, frames }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Queue an access unit for the recording subprocess.
    ///
    /// Returns `false` if the session has already finished.
    pub async fn write(&self, frame: Bytes) -> bool {
        self.frames.send(frame).await.is_ok()
    }
}

/// Telemetry side-channel attached by a viewer.
#[async_trait]
pub trait SideChannel: Send + Sync {
    /// Send one text message. An error means the viewer is gone.
    async fn send_text(&self, text: String) -> Result<()>;

    /// Label for logging.
    fn label(&self) -> String;
}

/// Telemetry message broadcast on every side-channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Telemetry {
    #[serde(rename = "Motion")]
    pub motion: f64,
    #[serde(rename = "Threshold")]
    pub threshold: f64,
}

/// Mutable camera state. One lock covers all three fields; the broadcast
/// reads the channel set and the motion value together.
#[derive(Default)]
pub struct CameraState {
    pub recording: RecordingSink,
    pub channels: Vec<Arc<dyn SideChannel>>,
    pub motion: f64,
}

/// Static configuration of one camera.
#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub id: String,
    /// Source URL, possibly with embedded credentials.
    pub url: Url,
    /// Recording is administratively enabled.
    pub record: bool,
    /// Motion threshold; 0 disables motion detection.
    pub threshold: f64,
    pub acl: AccessList,
}

/// A camera known to the recorder.
pub struct Camera {
    settings: CameraSettings,
    track: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
    state: RwLock<CameraState>,
}

impl Camera {
    /// `cancel` is this camera's node in the cancellation tree; every task
    /// working on the camera stops when it fires.
    pub fn new(
        settings: CameraSettings,
        track: Arc<TrackLocalStaticSample>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            track,
            cancel,
            state: RwLock::new(CameraState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn url(&self) -> &Url {
        &self.settings.url
    }

    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    pub fn threshold(&self) -> f64 {
        self.settings.threshold
    }

    pub fn record_enabled(&self) -> bool {
        self.settings.record
    }

    /// Motion detection runs only when a threshold is set and recording is
    /// enabled, since both share the transcoder.
    pub fn motion_enabled(&self) -> bool {
        self.settings.threshold != 0.0 && self.settings.record
    }

    pub fn acl(&self) -> &AccessList {
        &self.settings.acl
    }

    /// The shared outbound live track. Viewers reference it; ingest writes it.
    pub fn track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.track
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // --- recording sink ---

    pub fn recording_sink(&self) -> RecordingSink {
        self.state.read().recording.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.state.read().recording.is_recording()
    }

    /// Install an active recording sink.
    pub fn set_recording(&self, handle: RecordingHandle) {
        self.state.write().recording = RecordingSink::Recording(handle);
    }

    /// Reset the sink to [`RecordingSink::NotRecording`] if it still belongs
    /// to `session_id`. Returns whether the sink was cleared.
    pub fn clear_recording(&self, session_id: u64) -> bool {
        let mut state = self.state.write();
        if state.recording.session_id() == Some(session_id) {
            state.recording = RecordingSink::NotRecording;
            true
        } else {
            false
        }
    }

    // --- motion ---

    pub fn motion(&self) -> f64 {
        self.state.read().motion
    }

    pub fn set_motion(&self, motion: f64) {
        self.state.write().motion = motion;
    }

    // --- side channels ---

    pub fn attach_channel(&self, channel: Arc<dyn SideChannel>) {
        let mut state = self.state.write();
        state.channels.push(channel);
        tracing::debug!(
            camera = %self.id(),
            channels = state.channels.len(),
            "side channel attached"
        );
    }

    pub fn channel_count(&self) -> usize {
        self.state.read().channels.len()
    }

    /// Current telemetry and the channels to deliver it to.
    pub fn telemetry_snapshot(&self) -> (Telemetry, Vec<Arc<dyn SideChannel>>) {
        let state = self.state.read();
        (
            Telemetry {
                motion: state.motion,
                threshold: self.settings.threshold,
            },
            state.channels.clone(),
        )
    }

    /// Drop the given channels from the set. Returns how many were removed.
    pub fn prune_channels(&self, gone: &[Arc<dyn SideChannel>]) -> usize {
        if gone.is_empty() {
            return 0;
        }
        let mut state = self.state.write();
        let before = state.channels.len();
        state
            .channels
            .retain(|c| !gone.iter().any(|g| Arc::ptr_eq(c, g)));
        before - state.channels.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::live_track;

    pub(crate) fn test_camera(id: &str, threshold: f64, record: bool) -> Arc<Camera> {
        let track = Arc::new(live_track());
        Arc::new(Camera::new(
            CameraSettings {
                id: id.to_string(),
                url: Url::parse("rtsp://admin:pw@127.0.0.1:554/stream").unwrap(),
                record,
                threshold,
                acl: AccessList::allow_all(),
            },
            track,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn sink_starts_not_recording() {
        let cam = test_camera("front", 5.0, true);
        assert!(!cam.is_recording());
        assert!(matches!(cam.recording_sink(), RecordingSink::NotRecording));
    }

    #[test]
    fn clear_only_own_session() {
        let cam = test_camera("front", 5.0, true);
        let (tx, _rx) = mpsc::channel(1);
        cam.set_recording(RecordingHandle::new(7, tx));
        assert!(cam.is_recording());

        assert!(!cam.clear_recording(6));
        assert!(cam.is_recording());
        assert!(cam.clear_recording(7));
        assert!(!cam.is_recording());
    }

    #[tokio::test]
    async fn handle_write_fails_after_session_ends() {
        let (tx, rx) = mpsc::channel(1);
        let handle = RecordingHandle::new(1, tx);
        drop(rx);
        assert!(!handle.write(Bytes::from_static(b"x")).await);
    }

    #[test]
    fn motion_enabled_needs_threshold_and_record() {
        assert!(test_camera("a", 5.0, true).motion_enabled());
        assert!(!test_camera("b", 0.0, true).motion_enabled());
        assert!(!test_camera("c", 5.0, false).motion_enabled());
    }

    #[test]
    fn telemetry_wire_names() {
        let json = serde_json::to_string(&Telemetry {
            motion: 1.5,
            threshold: 5.0,
        })
        .unwrap();
        assert_eq!(json, r#"{"Motion":1.5,"Threshold":5.0}"#);
    }
}
