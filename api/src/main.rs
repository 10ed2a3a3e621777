mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use dropwatch_common::config::Config;
use dropwatch_detector::{BroadcastHub, PipelineDriver, PipelineSettings, SnapshotStore};
use routes::AppState;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

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
        bind = config.server.bind,
        fps_limit = config.stream.fps_limit,
        min_area_ratio = config.detection.min_area_ratio,
        persistence_frames = config.detection.persistence_frames,
        cooldown_secs = config.detection.cooldown_secs,
        snapshot_dir = config.snapshots.dir,
        "starting dropwatch"
    );

    let store = match SnapshotStore::open(&config.snapshots).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, dir = config.snapshots.dir, "failed to open snapshot store");
            std::process::exit(1);
        }
    };

    let mut source = match dropwatch_camera::open_source(&config.source).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open frame source; pipeline not started");
            std::process::exit(1);
        }
    };

    let hub = Arc::new(BroadcastHub::new());
    let cancel = CancellationToken::new();

    let mut driver = PipelineDriver::new(
        PipelineSettings::from_config(&config),
        Arc::clone(&hub),
        Arc::clone(&store) as Arc<dyn dropwatch_detector::TriggerSink>,
    );
    let driver_cancel = cancel.clone();
    let driver_task =
        tokio::spawn(async move { driver.run(source.as_mut(), driver_cancel).await });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let app = routes::router(Arc::new(AppState { hub, store }));

    let listener = match tokio::net::TcpListener::bind(&config.server.bind).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, bind = config.server.bind, "failed to bind HTTP listener");
            cancel.cancel();
            std::process::exit(1);
        }
    };
    info!(addr = config.server.bind, "dropwatch server listening");

    let server_cancel = cancel.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await
    {
        error!(error = %e, "HTTP server failed");
        cancel.cancel();
    }

    match driver_task.await {
        Ok(summary) => info!(
            frames = summary.frames_processed,
            triggers = summary.triggers_fired,
            "dropwatch stopped"
        ),
        Err(e) => error!(error = %e, "pipeline task panicked"),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
