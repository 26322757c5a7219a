/// Application name
pub const APP_NAME: &str = "BUZ";

/// Default HTTP / WebSocket listen port
pub const DEFAULT_HTTP_PORT: u16 = 10_000;

/// Default path the WebSocket upgrade is served on
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Maximum inbound frame size in bytes (5 MB)
pub const MAX_MESSAGE_BYTES: usize = 5_000_000;

/// Heartbeat probe interval in milliseconds
pub const PING_INTERVAL_MS: u64 = 30_000;

/// Idle time after which a chunked transfer is discarded, in milliseconds
pub const CHUNK_TIMEOUT_MS: u64 = 30_000;

/// How often stale chunked transfers are swept, in milliseconds
pub const CHUNK_SWEEP_INTERVAL_MS: u64 = 5_000;

/// Per-connection outbound queue depth (frames)
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;
