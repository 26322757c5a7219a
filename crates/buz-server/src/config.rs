//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use buz_shared::constants::{
    CHUNK_SWEEP_INTERVAL_MS, CHUNK_TIMEOUT_MS, DEFAULT_HTTP_PORT, DEFAULT_WS_PATH,
    MAX_MESSAGE_BYTES, OUTBOUND_QUEUE_DEPTH, PING_INTERVAL_MS,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP / WebSocket listener.
    /// Env: `HTTP_ADDR`, or `PORT` to only change the port.
    /// Default: `0.0.0.0:10000`
    pub http_addr: SocketAddr,

    /// Path the WebSocket upgrade is served on.
    /// Env: `WS_PATH`
    /// Default: `/ws`
    pub ws_path: String,

    /// Heartbeat probe interval. A connection silent for two intervals is
    /// closed.
    /// Env: `PING_INTERVAL_MS`
    pub ping_interval: Duration,

    /// Largest inbound frame accepted; bigger ones get
    /// `error{message_too_large}`.
    /// Env: `MAX_MESSAGE_BYTES`
    pub max_message_bytes: usize,

    /// Idle time after which a chunked transfer is discarded.
    /// Env: `CHUNK_TIMEOUT_MS`
    pub chunk_timeout: Duration,

    /// How often stale chunked transfers are swept.
    /// Env: `CHUNK_SWEEP_INTERVAL_MS`
    pub chunk_sweep_interval: Duration,

    /// Whether audio is also delivered back to the sender's own connections.
    /// Env: `ECHO_TO_SENDER` (true/false)
    /// Default: `false`
    pub echo_to_sender: bool,

    /// Whether `user_status` online/offline events are sent to all sessions.
    /// Env: `PRESENCE_ENABLED` (true/false)
    /// Default: `true`
    pub presence_enabled: bool,

    /// Frames buffered per connection before new ones are dropped.
    /// Env: `OUTBOUND_QUEUE`
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            ws_path: DEFAULT_WS_PATH.to_string(),
            ping_interval: Duration::from_millis(PING_INTERVAL_MS),
            max_message_bytes: MAX_MESSAGE_BYTES,
            chunk_timeout: Duration::from_millis(CHUNK_TIMEOUT_MS),
            chunk_sweep_interval: Duration::from_millis(CHUNK_SWEEP_INTERVAL_MS),
            echo_to_sender: false,
            presence_enabled: true,
            outbound_queue: OUTBOUND_QUEUE_DEPTH,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => config.http_addr.set_port(port),
                Err(_) => tracing::warn!(value = %port, "Invalid PORT, using default"),
            }
        }

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(
                    value = %addr,
                    "Invalid HTTP_ADDR, using default"
                );
            }
        }

        if let Some(path) = lookup("WS_PATH") {
            let path = path.trim();
            if path.starts_with('/') {
                config.ws_path = path.to_string();
            } else {
                tracing::warn!(value = %path, "WS_PATH must start with '/', using default");
            }
        }

        if let Some(ms) = parse_positive::<u64>(&lookup, "PING_INTERVAL_MS") {
            config.ping_interval = Duration::from_millis(ms);
        }

        if let Some(bytes) = parse_positive::<usize>(&lookup, "MAX_MESSAGE_BYTES") {
            config.max_message_bytes = bytes;
        }

        if let Some(ms) = parse_positive::<u64>(&lookup, "CHUNK_TIMEOUT_MS") {
            config.chunk_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_positive::<u64>(&lookup, "CHUNK_SWEEP_INTERVAL_MS") {
            config.chunk_sweep_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("ECHO_TO_SENDER") {
            config.echo_to_sender = val == "true" || val == "1";
        }

        if let Some(val) = lookup("PRESENCE_ENABLED") {
            config.presence_enabled = val != "false" && val != "0";
        }

        if let Some(depth) = parse_positive::<usize>(&lookup, "OUTBOUND_QUEUE") {
            config.outbound_queue = depth;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Read a strictly positive number, warning about (and ignoring) anything else.
fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Some(value),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
