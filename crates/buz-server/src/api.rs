use std::sync::Arc;

use axum::{
    extract::State,
    http::Method,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use buz_shared::constants::APP_NAME;

use crate::config::ServerConfig;
use crate::relay::{Relay, RelayStats};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);
    let ws_path = state.config.ws_path.clone();

    Router::new()
        .route("/", get(banner))
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route(&ws_path, get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: &'static str,
    version: &'static str,
    ws_path: String,
    echo_to_sender: bool,
    #[serde(flatten)]
    stats: RelayStats,
}

async fn banner() -> String {
    format!(
        "{} WebSocket relay running (v{})\n",
        APP_NAME,
        env!("CARGO_PKG_VERSION")
    )
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: APP_NAME,
        version: env!("CARGO_PKG_VERSION"),
        ws_path: state.config.ws_path.clone(),
        echo_to_sender: state.config.echo_to_sender,
        stats: state.relay.stats().await,
    })
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP / WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
