mod access;
mod api;
mod config;
mod error;
mod session;
mod storage;
mod upload;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use deaddrop_shared::constants::{SESSION_SWEEP_INTERVAL_SECS, UPLOAD_SWEEP_INTERVAL_SECS};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::session::SessionManager;
use crate::storage::FileStore;
use crate::upload::UploadEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,deaddrop_server=debug")),
        )
        .init();

    info!(
        "Starting deaddrop relay server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(ServerConfig::from_env());
    info!(?config, "Loaded configuration");

    let store = Arc::new(
        FileStore::new(config.storage_root.clone(), config.base_url.clone()).await?,
    );
    let sessions = SessionManager::new(store.clone(), config.clone());
    let uploads = Arc::new(UploadEngine::new(store.clone()));

    // Session sweeper: tiered-grace expiry plus orphan directory cleanup.
    let session_sweeper = sessions.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            session_sweeper.sweep_once().await;
        }
    });

    // Upload sweeper: drop chunked uploads idle past their TTL.
    let upload_sweeper = uploads.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(UPLOAD_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            upload_sweeper.sweep_once().await;
        }
    });

    let state = AppState {
        sessions,
        uploads,
        store,
        config: config.clone(),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    tokio::select! {
        result = api::serve(state, addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
