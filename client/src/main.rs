mod api;
mod controller;
mod render;
mod submit;

use frame_verdict_capture::session::CaptureSession;
use frame_verdict_capture::source::{self, camera};
use frame_verdict_common::config::{Config, ConfigError, SourceKind};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::api::AppState;
use crate::controller::{Controller, ViewState};
use crate::submit::{SubmissionPipeline, SubmitError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("control surface stopped: {0}")]
    Serve(std::io::Error),
    #[error("controller is no longer running")]
    ControllerGone,
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        source = ?config.source.kind,
        endpoint = config.service.endpoint,
        frames = config.capture.frames,
        interval_ms = config.capture.interval_ms,
        "starting frame-verdict client"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "client stopped");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), ClientError> {
    if config.source.kind == SourceKind::Camera {
        camera::check_ffmpeg_available().await;
    }

    let frame_source = source::from_config(&config.source);
    let pipeline = Arc::new(SubmissionPipeline::new(&config.service)?);
    let session = CaptureSession::from_config(&config.capture);
    // validate() guarantees at least one model
    let default_model = config.api.models.first().cloned().unwrap_or_default();

    let (controller, handle) = Controller::new(
        frame_source,
        session,
        pipeline,
        config.labels.clone(),
        default_model,
    );
    let controller_task = controller::spawn(controller);
    tokio::spawn(log_notices(handle.subscribe()));

    let app = api::router(Arc::new(AppState::new(
        handle.clone(),
        config.api.models.clone(),
    )));
    let addr = config.api.bind.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ClientError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(addr, "control surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ClientError::Serve)?;

    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "controller already stopped");
    }
    if let Err(e) = controller_task.await {
        error!(error = %e, "controller task failed");
    }
    info!("frame-verdict client stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Log each user-facing notice once, the way a renderer would show it.
async fn log_notices(mut view: watch::Receiver<ViewState>) {
    let mut last_seen = 0;
    while view.changed().await.is_ok() {
        let notice = view.borrow_and_update().notice.clone();
        if let Some(notice) = notice.filter(|n| n.id > last_seen) {
            last_seen = notice.id;
            info!(kind = ?notice.kind, message = %notice.message, "notice");
        }
    }
}
