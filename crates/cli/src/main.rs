use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use nvr::{Nvr, NvrConfig, NvrOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "nvr",
    about = "Network video recorder: RTSP cameras to WebRTC, motion-triggered recording"
)]
struct Args {
    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:80")]
    http: SocketAddr,

    /// RTSP proxy listen address; empty disables the proxy
    #[arg(long, default_value = "0.0.0.0:8554")]
    rtsp: String,

    /// Camera configuration file
    #[arg(long, default_value = "./sources.json")]
    config: PathBuf,

    /// Transcoder command line; empty disables motion detection and recording
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    /// Recording output directory
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Debug logging and transcoder stderr passthrough
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let rtsp_addr = match args.rtsp.trim() {
        "" => None,
        addr => match addr.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::error!(addr, error = %e, "invalid --rtsp address");
                return ExitCode::FAILURE;
            }
        },
    };

    let config = match NvrConfig::load(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "could not load configuration");
            return ExitCode::FAILURE;
        }
    };

    let options = NvrOptions {
        http_addr: args.http,
        rtsp_addr,
        transcoder: NvrOptions::parse_transcoder(&args.ffmpeg),
        record_dir: args.dir,
        debug: args.debug,
    };

    let nvr = match Nvr::new(&config, options) {
        Ok(nvr) => nvr,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = nvr.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received");
                shutdown.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "could not install interrupt handler"),
        }
    });

    match nvr.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "recorder stopped");
            ExitCode::FAILURE
        }
    }
}
