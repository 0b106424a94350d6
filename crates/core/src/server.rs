use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{NvrConfig, NvrOptions};
use crate::error::{NvrError, Result};
use crate::http;
use crate::ingest::Ingest;
use crate::live::{self, LiveDistribution};
use crate::proxy::RtspProxy;
use crate::recording::RecordingManager;
use crate::registry::Registry;
use crate::transcode::Transcoder;

/// Recorder orchestrator.
///
/// Owns the camera registry and the shared services, and runs one ingest
/// loop and one telemetry broadcaster per camera next to the HTTP server
/// and the RTSP proxy. Everything hangs off one root cancellation token;
/// each camera gets a child of it.
pub struct Nvr {
    registry: Arc<Registry>,
    live: Arc<LiveDistribution>,
    recorder: Arc<RecordingManager>,
    transcoder: Transcoder,
    options: NvrOptions,
    cancel: CancellationToken,
}

impl Nvr {
    /// Build the registry from a validated configuration.
    ///
    /// Fails on any configuration error; nothing has been started yet.
    pub fn new(config: &NvrConfig, options: NvrOptions) -> Result<Self> {
        let cancel = CancellationToken::new();
        let registry = Arc::new(Registry::new(config.camera_settings()?, &cancel));
        let live = Arc::new(LiveDistribution::new(registry.clone())?);
        let transcoder = Transcoder::new(options.transcoder.clone(), options.debug);
        let recorder = Arc::new(RecordingManager::new(
            options.record_dir.clone(),
            transcoder.clone(),
        ));

        Ok(Self {
            registry,
            live,
            recorder,
            transcoder,
            options,
            cancel,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bind the listeners, start every task, and run until shutdown.
    ///
    /// Returns an error if a listener cannot be bound or the HTTP server
    /// fails; per-camera failures are only logged.
    pub async fn run(self) -> Result<()> {
        let http_listener = TcpListener::bind(self.options.http_addr).await?;
        let proxy = match self.options.rtsp_addr {
            Some(addr) => Some(RtspProxy::bind(addr, self.registry.clone()).await?),
            None => None,
        };
        if !self.transcoder.is_enabled() {
            tracing::warn!("no transcoder configured, motion detection and recording disabled");
        }

        let mut tasks = JoinSet::new();
        for camera in self.registry.iter() {
            tracing::info!(
                camera = %camera.id(),
                record = camera.record_enabled(),
                threshold = camera.threshold(),
                "starting camera"
            );
            let ingest = Ingest::new(camera.clone(), self.transcoder.clone(), self.recorder.clone());
            tasks.spawn(ingest.run());
            tasks.spawn(live::broadcast_loop(camera.clone(), live::BROADCAST_PERIOD));
        }
        if let Some(proxy) = proxy {
            tasks.spawn(proxy.run(self.cancel.clone()));
        }

        let router = http::router(self.registry.clone(), self.live.clone());
        let mut http_task = tokio::spawn(http::serve(http_listener, router, self.cancel.clone()));

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            joined = &mut http_task => {
                let result = match joined {
                    Ok(result) => result,
                    Err(e) => Err(NvrError::Io(std::io::Error::other(e))),
                };
                if let Err(e) = &result {
                    tracing::error!(error = %e, "HTTP server failed");
                }
                result
            }
        };

        tracing::info!("shutting down");
        self.cancel.cancel();
        self.live.close_all().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "task ended abnormally");
            }
        }
        if !http_task.is_finished() {
            let _ = http_task.await;
        }
        result
    }
}
