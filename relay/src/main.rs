mod delivery;
mod ingest;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use frame_relay_common::config::Config;
use server::AppState;
use store::FrameStore;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("server terminated: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() {
    // An explicit path must exist; the default one is optional.
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Config::load(&path).map_err(|e| (path, e)),
        None => {
            let path = PathBuf::from("config.toml");
            Config::load_or_default(&path).map_err(|e| (path, e))
        }
    };
    let mut config = match config {
        Ok(c) => c,
        Err((path, e)) => {
            eprintln!("Failed to load config from {}: {e}", path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let port_env = std::env::var("PORT").ok();
    if let Err(e) = config.apply_port_override(port_env.as_deref()) {
        warn!(error = %e, port = config.server.port, "ignoring PORT override");
    }

    let store = Arc::new(FrameStore::new());
    let state = AppState::new(store, config.relay.clone());

    if let Err(e) = run(&config, state).await {
        error!(error = %e, "frame relay stopped");
        std::process::exit(1);
    }
}

async fn run(config: &Config, state: AppState) -> Result<(), RelayError> {
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayError::Bind(addr.clone(), e))?;

    info!(
        addr,
        poll_interval_ms = config.relay.poll_interval_ms,
        max_frame_bytes = config.relay.max_frame_bytes,
        "frame relay listening"
    );
    info!("ingest: ws://HOST:{}/stream (WebSocket, binary frames)", config.server.port);
    info!("ingest: http://HOST:{}/stream (multipart POST)", config.server.port);
    info!("viewer: http://HOST:{}/mjpeg", config.server.port);
    info!("viewer: http://HOST:{}/snapshot.jpg", config.server.port);
    info!("viewer: http://HOST:{}/", config.server.port);

    axum::serve(listener, server::router(state))
        .await
        .map_err(RelayError::Serve)
}
