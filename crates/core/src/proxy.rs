//! RTSP proxy for clients that cannot speak WebRTC.
//!
//! Clients address cameras by id (`rtsp://nvr:8554/front`). The first
//! `OPTIONS` or `DESCRIBE` picks the camera and opens one connection to it;
//! every request is then rewritten onto the camera's real address, given the
//! camera's credentials as a Basic `Authorization` header, and forwarded.
//! Camera bytes flow back to the client untouched.
//!
//! ```text
//!  client ──request──► rewrite target, set Authorization ──► camera
//!  client ◄──────────── raw copy (responses, interleaved RTP) ── camera
//! ```
//!
//! Any failure (unknown or denied camera, dial error, a request before a
//! destination is known, malformed input) closes the client connection.

use std::net::SocketAddr;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::camera::Camera;
use crate::error::{NvrError, Result};
use crate::ingest::split_credentials;
use crate::protocol::{RtspRequest, basic_auth};
use crate::registry::Registry;

/// Port dialled when a camera URL names none.
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// Accepts RTSP clients and relays them to cameras.
pub struct RtspProxy {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl RtspProxy {
    pub async fn bind(addr: impl ToSocketAddrs, registry: Arc<Registry>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "RTSP proxy listening");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registry = self.registry.clone();
                        tokio::spawn(Connection::handle(stream, peer, registry, cancel.child_token()));
                    }
                    Err(e) => tracing::warn!(error = %e, "proxy accept error"),
                }
            }
        }
        tracing::debug!("proxy accept loop exited");
    }
}

/// The camera side of a proxied connection.
struct Upstream {
    camera: Arc<Camera>,
    writer: OwnedWriteHalf,
    authorization: Option<String>,
    copy: JoinHandle<()>,
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.copy.abort();
    }
}

/// A single proxied client connection.
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    /// Client write half; moves into the copy task once a camera is dialled.
    client_writer: Option<OwnedWriteHalf>,
    peer: SocketAddr,
    registry: Arc<Registry>,
    upstream: Option<Upstream>,
}

impl Connection {
    async fn handle(
        stream: TcpStream,
        peer: SocketAddr,
        registry: Arc<Registry>,
        cancel: CancellationToken,
    ) {
        tracing::info!(%peer, "proxy client connected");
        let (reader, writer) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(reader),
            client_writer: Some(writer),
            peer,
            registry,
            upstream: None,
        };

        let reason = tokio::select! {
            _ = cancel.cancelled() => "server shutting down".to_string(),
            result = conn.run() => match result {
                Ok(()) => "connection closed by client".to_string(),
                Err(e) => e.to_string(),
            },
        };
        let camera = conn.upstream.as_ref().map(|up| up.camera.id().to_string());
        tracing::info!(%peer, camera = ?camera, %reason, "proxy client disconnected");
    }

    async fn run(&mut self) -> Result<()> {
        loop {
            let mut request = match RtspRequest::read_from(&mut self.reader).await {
                Ok(request) => request,
                Err(NvrError::EndOfStream) => return Ok(()),
                Err(e) => return Err(e),
            };
            tracing::debug!(
                peer = %self.peer,
                method = %request.method,
                uri = %request.uri,
                "proxy request"
            );

            if request.method == "OPTIONS" || request.method == "DESCRIBE" {
                self.select_camera(&mut request).await?;
            } else if let Some(up) = &self.upstream {
                if let Some(suffix) = camera_suffix(&request.url, up.camera.id()) {
                    request.set_url(rewrite_target(&request.url, up.camera.url(), &suffix));
                }
            }

            let up = self.upstream.as_mut().ok_or(NvrError::NoDestination)?;
            request.headers.remove("Authorization");
            if let Some(auth) = &up.authorization {
                request.headers.set("Authorization", auth);
            }
            request.write_to(&mut up.writer).await?;
        }
    }

    /// Resolve the camera named by an OPTIONS/DESCRIBE target, dial it if
    /// no camera is connected yet, and rewrite the target onto it.
    async fn select_camera(&mut self, request: &mut RtspRequest) -> Result<()> {
        let path = percent_decode_str(request.url.path()).decode_utf8_lossy();
        let id = path.strip_prefix('/').unwrap_or(&path);
        let camera = self.registry.resolve(id, self.peer.ip())?.clone();

        if let Some(up) = &self.upstream {
            if !Arc::ptr_eq(&up.camera, &camera) {
                return Err(NvrError::CameraNotFound(id.to_string()));
            }
        } else {
            self.upstream = Some(self.dial(camera.clone()).await?);
        }

        request.set_url(rewrite_target(&request.url, camera.url(), ""));
        Ok(())
    }

    async fn dial(&mut self, camera: Arc<Camera>) -> Result<Upstream> {
        let url = camera.url();
        let host = url.host_str().ok_or_else(|| NvrError::InvalidCameraUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })?;
        let addr = format!("{host}:{}", url.port().unwrap_or(DEFAULT_RTSP_PORT));
        let (_, credentials) = split_credentials(url)?;
        let authorization = credentials.map(|c| basic_auth(&c.username, &c.password));

        let stream = TcpStream::connect(&addr).await?;
        tracing::debug!(peer = %self.peer, camera = %camera.id(), %addr, "camera dialled");
        let (mut camera_reader, writer) = stream.into_split();
        let mut client_writer = self.client_writer.take().ok_or(NvrError::NoDestination)?;

        let peer = self.peer;
        let copy = tokio::spawn(async move {
            match tokio::io::copy(&mut camera_reader, &mut client_writer).await {
                Ok(bytes) => tracing::debug!(%peer, bytes, "camera stream ended"),
                Err(e) => tracing::debug!(%peer, error = %e, "camera copy failed"),
            }
        });

        Ok(Upstream {
            camera,
            writer,
            authorization,
            copy,
        })
    }
}

/// Path remainder after `/<id>` when `target` addresses camera `id`.
///
/// `/front` gives `""`, `/front/track1` gives `"/track1"`, anything else
/// gives `None`.
fn camera_suffix(target: &Url, id: &str) -> Option<String> {
    let path = percent_decode_str(target.path()).decode_utf8_lossy();
    let rest = path.strip_prefix('/')?.strip_prefix(id)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest.to_string())
    } else {
        None
    }
}

/// `target` moved onto the camera's host, port and path, with `suffix`
/// appended to the path. Credentials are never part of the result.
fn rewrite_target(target: &Url, camera: &Url, suffix: &str) -> Url {
    let mut url = camera.clone();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    if !suffix.is_empty() {
        let path = format!("{}{suffix}", camera.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    url.set_query(target.query());
    url.set_fragment(None);
    url
}
