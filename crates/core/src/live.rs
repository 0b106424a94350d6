//! Live distribution over WebRTC.
//!
//! Every camera owns one outbound H.264 track that ingest writes into. A
//! viewer negotiates a peer connection per camera (offer in, answer out);
//! the connection references the shared track, so adding a viewer costs no
//! extra ingest work.
//!
//! ```text
//!   browser                           recorder
//!      │  POST /{id}  {type: offer}       │
//!      │ ───────────────────────────────► │ new peer connection
//!      │                                  │ set remote, add shared track
//!      │                                  │ answer, wait for ICE gathering
//!      │ ◄─────────────────────────────── │
//!      │     {type: answer, sdp}          │
//!      │                                  │
//!      │ ◄──── data channel, every 2 s ── │ {"Motion": m, "Threshold": t}
//! ```
//!
//! Data channels opened by the viewer become telemetry side-channels. A
//! channel whose send fails is dropped during the same broadcast pass.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::interceptor::registry::Registry as InterceptorRegistry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;

use crate::camera::{Camera, SideChannel};
use crate::error::{NvrError, Result};
use crate::registry::Registry;

/// Interval between telemetry broadcasts.
pub const BROADCAST_PERIOD: Duration = Duration::from_secs(2);

static VIEWER_COUNTER: AtomicU64 = AtomicU64::new(1);

type Viewers = Arc<Mutex<HashMap<u64, Arc<RTCPeerConnection>>>>;

/// Negotiates viewer sessions.
pub struct LiveDistribution {
    api: API,
    registry: Arc<Registry>,
    viewers: Viewers,
}

impl LiveDistribution {
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let interceptors =
            register_default_interceptors(InterceptorRegistry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        Ok(Self {
            api,
            registry,
            viewers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Number of live viewer sessions.
    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().len()
    }

    /// Answer a viewer's offer for `camera_id`.
    ///
    /// Returns [`NvrError::CameraNotFound`] for unknown ids and for callers
    /// the camera's access list rejects. The answer is returned only after
    /// ICE gathering completes, so it carries every local candidate.
    pub async fn negotiate(
        &self,
        camera_id: &str,
        remote: SocketAddr,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription> {
        let camera = self.registry.resolve(camera_id, remote.ip())?.clone();

        let pc = Arc::new(self.api.new_peer_connection(RTCConfiguration::default()).await?);
        match answer(&camera, &pc, offer).await {
            Ok(answer) => {
                let viewer = VIEWER_COUNTER.fetch_add(1, Ordering::Relaxed);
                watch_viewer(&self.viewers, viewer, &pc, camera.id());
                self.viewers.lock().insert(viewer, pc);
                tracing::info!(camera = %camera.id(), %remote, viewer, "viewer connected");
                Ok(answer)
            }
            Err(e) => {
                tracing::warn!(camera = %camera.id(), %remote, error = %e, "negotiation failed");
                if let Err(close) = pc.close().await {
                    tracing::debug!(error = %close, "close after failed negotiation");
                }
                Err(e)
            }
        }
    }

    /// Close every viewer session.
    pub async fn close_all(&self) {
        let viewers: Vec<_> = self.viewers.lock().drain().map(|(_, pc)| pc).collect();
        for pc in viewers {
            if let Err(e) = pc.close().await {
                tracing::debug!(error = %e, "close viewer");
            }
        }
    }
}

async fn answer(
    camera: &Arc<Camera>,
    pc: &Arc<RTCPeerConnection>,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription> {
    pc.set_remote_description(offer).await?;

    let for_channels = Arc::downgrade(camera);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        register_on_open(for_channels.clone(), dc);
        Box::pin(async {})
    }));

    let track: Arc<dyn TrackLocal + Send + Sync> = camera.track().clone();
    pc.add_track(track).await?;

    let mut gathered = pc.gathering_complete_promise().await;
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer).await?;
    let _ = gathered.recv().await;

    pc.local_description()
        .await
        .ok_or_else(|| NvrError::WebRtc(webrtc::Error::new("no local description".to_owned())))
}

/// Attach `dc` to the camera's side-channels once it opens.
fn register_on_open(camera: Weak<Camera>, dc: Arc<RTCDataChannel>) {
    let channel = Arc::downgrade(&dc);
    dc.on_open(Box::new(move || {
        if let (Some(camera), Some(dc)) = (camera.upgrade(), channel.upgrade()) {
            tracing::debug!(camera = %camera.id(), label = %dc.label(), "data channel open");
            camera.attach_channel(dc);
        }
        Box::pin(async {})
    }));
}

/// Close and release the viewer when its connection fails or closes.
fn watch_viewer(viewers: &Viewers, viewer: u64, pc: &Arc<RTCPeerConnection>, camera_id: &str) {
    let viewers = Arc::downgrade(viewers);
    let pc_weak = Arc::downgrade(pc);
    let camera_id = camera_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        viewer_state_changed(&viewers, viewer, &pc_weak, &camera_id, state);
        Box::pin(async {})
    }));
}

/// React to a viewer's connection state.
///
/// Runs inside the peer connection's state handler, which the connection
/// holds locked while it runs; `close()` waits on that same lock, so a
/// failed connection is closed from a separate task. Returns that task.
fn viewer_state_changed(
    viewers: &Weak<Mutex<HashMap<u64, Arc<RTCPeerConnection>>>>,
    viewer: u64,
    pc: &Weak<RTCPeerConnection>,
    camera_id: &str,
    state: RTCPeerConnectionState,
) -> Option<JoinHandle<()>> {
    tracing::debug!(camera = %camera_id, viewer, %state, "viewer state");
    if !matches!(
        state,
        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
    ) {
        return None;
    }
    if let Some(viewers) = viewers.upgrade() {
        if viewers.lock().remove(&viewer).is_some() {
            tracing::info!(camera = %camera_id, viewer, %state, "viewer released");
        }
    }
    if state != RTCPeerConnectionState::Failed {
        return None;
    }
    let pc = pc.upgrade()?;
    let camera_id = camera_id.to_string();
    Some(tokio::spawn(async move {
        if let Err(e) = pc.close().await {
            tracing::warn!(camera = %camera_id, viewer, error = %e, "close failed viewer");
        }
    }))
}

#[async_trait]
impl SideChannel for RTCDataChannel {
    async fn send_text(&self, text: String) -> Result<()> {
        RTCDataChannel::send_text(self, text).await?;
        Ok(())
    }

    fn label(&self) -> String {
        RTCDataChannel::label(self).to_string()
    }
}

/// Send the camera's telemetry on every side-channel once.
///
/// Channels whose send fails are removed. Returns how many were removed.
pub async fn broadcast_once(camera: &Camera) -> Result<usize> {
    let (telemetry, channels) = camera.telemetry_snapshot();
    if channels.is_empty() {
        return Ok(0);
    }
    let text = serde_json::to_string(&telemetry)?;

    let mut gone = Vec::new();
    for channel in channels {
        if let Err(e) = channel.send_text(text.clone()).await {
            tracing::debug!(
                camera = %camera.id(),
                channel = %channel.label(),
                error = %e,
                "side channel gone"
            );
            gone.push(channel);
        }
    }
    Ok(camera.prune_channels(&gone))
}

/// Broadcast telemetry every `period` until the camera is cancelled.
pub async fn broadcast_loop(camera: Arc<Camera>, period: Duration) {
    let cancel = camera.cancel_token().clone();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match broadcast_once(&camera).await {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(camera = %camera.id(), pruned, "side channels pruned"),
            Err(e) => {
                tracing::error!(camera = %camera.id(), error = %e, "telemetry broadcast stopped");
                break;
            }
        }
    }
}
