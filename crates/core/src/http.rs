//! HTTP front end: the viewer page and WebRTC signalling.
//!
//! | route        | response                                              |
//! |--------------|-------------------------------------------------------|
//! | `GET /`      | page listing the cameras the caller may see           |
//! | `POST /{id}` | SDP offer (JSON) in, SDP answer (JSON) out            |
//!
//! Unknown and denied cameras both get the same `404`; anything else that
//! goes wrong during negotiation is a `500`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{NvrError, Result};
use crate::live::LiveDistribution;
use crate::registry::Registry;

const INDEX_HTML: &str = include_str!("index.html");
const SOURCES_PLACEHOLDER: &str = "__SOURCES__";

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    live: Arc<LiveDistribution>,
}

#[derive(Debug)]
enum ApiError {
    NotFound,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            ApiError::Internal(msg) => {
                tracing::debug!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "negotiation failed").into_response()
            }
        }
    }
}

impl From<NvrError> for ApiError {
    fn from(err: NvrError) -> Self {
        match err {
            NvrError::CameraNotFound(_) => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub fn router(registry: Arc<Registry>, live: Arc<LiveDistribution>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/{id}", post(offer))
        .with_state(AppState { registry, live })
}

/// Serve `router` on `listener` until `cancel` fires.
pub async fn serve(listener: TcpListener, router: Router, cancel: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "HTTP listening");
    }
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;
    Ok(())
}

async fn index(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Html<String> {
    let ids = state.registry.visible_ids(peer.ip());
    Html(render_index(&ids))
}

fn render_index(ids: &[String]) -> String {
    let sources = serde_json::to_string(ids)
        .unwrap_or_else(|_| "[]".to_string())
        .replace("</", "<\\/");
    INDEX_HTML.replace(SOURCES_PLACEHOLDER, &sources)
}

/// Browsers post the offer without a JSON content type, so the body is
/// decoded by hand.
async fn offer(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    body: Bytes,
) -> std::result::Result<Json<RTCSessionDescription>, ApiError> {
    state.registry.resolve(&id, peer.ip())?;
    let offer: RTCSessionDescription =
        serde_json::from_slice(&body).map_err(|e| ApiError::Internal(e.to_string()))?;
    let answer = state.live.negotiate(&id, peer, offer).await?;
    Ok(Json(answer))
}
