//! Shared state of one relay instance.
//!
//! Everything here is an explicitly owned handle: two `Relay`s never share a
//! registry, so independent instances can run side by side (in tests, for
//! example).

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::broadcast::BroadcastEngine;
use crate::chunks::ChunkAssembler;
use crate::config::ServerConfig;
use crate::groups::GroupRegistry;
use crate::sessions::SessionRegistry;

/// Delivery policy knobs the supervisor needs per message.
#[derive(Debug, Clone, Copy)]
pub struct RelayPolicy {
    pub max_message_bytes: usize,
    pub echo_to_sender: bool,
    pub presence_enabled: bool,
}

impl From<&ServerConfig> for RelayPolicy {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_message_bytes: config.max_message_bytes,
            echo_to_sender: config.echo_to_sender,
            presence_enabled: config.presence_enabled,
        }
    }
}

#[derive(Clone)]
pub struct Relay {
    pub sessions: SessionRegistry,
    pub groups: GroupRegistry,
    pub chunks: ChunkAssembler,
    pub broadcaster: BroadcastEngine,
    pub policy: RelayPolicy,
}

impl Relay {
    pub fn new(config: &ServerConfig) -> Self {
        let sessions = SessionRegistry::new();
        let groups = GroupRegistry::new();
        let broadcaster = BroadcastEngine::new(sessions.clone(), groups.clone());
        Self {
            sessions,
            groups,
            chunks: ChunkAssembler::new(config.chunk_timeout),
            broadcaster,
            policy: RelayPolicy::from(config),
        }
    }

    /// Spawn the periodic sweep that reclaims abandoned chunk transfers.
    pub fn spawn_chunk_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let chunks = self.chunks.clone();
        info!(interval_ms = every.as_millis() as u64, "Starting chunk sweeper");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                chunks.purge_expired().await;
            }
        })
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            users_online: self.sessions.user_count().await,
            connections: self.sessions.connection_count().await,
            groups: self.groups.group_count().await,
            open_transfers: self.chunks.open_transfers().await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RelayStats {
    pub users_online: usize,
    pub connections: usize,
    pub groups: usize,
    pub open_transfers: usize,
}
