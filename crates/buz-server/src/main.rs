//! # buz-server
//!
//! Push-to-talk audio relay. Clients connect over WebSocket, log in with a
//! bare user identifier, join a named group and broadcast short audio clips
//! (whole, or uploaded in numbered chunks) to every other member.
//!
//! This binary provides:
//! - **Session / group registries** tracking who is online and where
//! - **Broadcast fan-out** to every connection of every group member
//! - **Chunk reassembly** with a sliding expiry window
//! - **Heartbeat** probing that closes half-open connections
//! - **HTTP endpoints** (axum) for health checks and relay statistics

mod api;
mod broadcast;
mod chunks;
mod config;
mod connection;
mod error;
mod groups;
mod relay;
mod sessions;
mod supervisor;
mod ws;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::relay::Relay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,buz_server=debug")),
        )
        .init();

    info!("Starting BUZ relay server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize relay state and background tasks
    // -----------------------------------------------------------------------
    let relay = Relay::new(&config);
    let sweeper = relay.spawn_chunk_sweeper(config.chunk_sweep_interval);

    let http_addr = config.http_addr;
    let app_state = AppState {
        relay,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP / WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                sweeper.abort();
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    sweeper.abort();
    Ok(())
}
