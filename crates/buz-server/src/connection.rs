//! Transport-agnostic handle to one client connection.
//!
//! The registries only ever hold clones of this handle. The transport task
//! owns the receiving end of the outbound queue and the socket itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use buz_shared::ServerMessage;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First block of the UUID is plenty for log correlation.
        let full = self.0.to_string();
        f.write_str(&full[..8])
    }
}

/// Frames queued for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<str>),
    Ping,
    Close,
}

#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    /// Create a handle plus the queue the transport writer drains.
    pub fn new(queue_depth: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let conn = Self {
            id: ConnectionId::new(),
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Queue an already-serialized frame. Never blocks: a closed connection
    /// or a full queue drops the frame and returns `false`.
    pub fn send_text(&self, text: Arc<str>) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx.try_send(Outbound::Text(text)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(conn = %self.id, "Dropping frame for slow connection");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn send(&self, msg: &ServerMessage) -> bool {
        match msg.to_json() {
            Ok(json) => self.send_text(Arc::from(json)),
            Err(e) => {
                warn!(conn = %self.id, error = %e, "Failed to serialize outbound message");
                false
            }
        }
    }

    /// Ask the writer for a transport-level liveness probe.
    pub fn probe(&self) -> bool {
        !self.is_closed() && self.tx.try_send(Outbound::Ping).is_ok()
    }

    /// Mark the connection closed. Later sends are no-ops. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.try_send(Outbound::Close);
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}
