mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use frame_cast_capture::Camera;
use frame_cast_common::config::Config;
use tracing::{error, info, warn};

use routes::AppState;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let mut config = match Config::load_or_default(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };
    if let Err(e) = config.apply_env().and_then(|()| config.validate()) {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        command = config.camera.command,
        width = config.camera.width,
        height = config.camera.height,
        fps = config.camera.fps,
        "starting frame-cast server"
    );

    // Capture starts on the first viewer, not here.
    let camera = Arc::new(Camera::rpicam(&config));
    let state = Arc::new(AppState::new(
        Arc::clone(&camera),
        config.stream.boundary.clone(),
    ));
    let app = routes::router(Arc::clone(&state));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!(addr, "frame-cast server listening");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
        .await
    {
        error!(error = %e, "server error");
    }

    camera.stop().await;
    info!("frame-cast server stopped");
}

/// Resolves on Ctrl-C or SIGTERM, after telling open streams to finish.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown requested, closing streams");
    state.shutdown.send_replace(true);
}
