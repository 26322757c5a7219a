use std::collections::HashMap;
use std::sync::Arc;

use buz_shared::{GroupName, UserId};
use tokio::sync::RwLock;
use tracing::debug;

use crate::connection::{Connection, ConnectionId};

/// One live connection of a user and the channel it currently sits in.
#[derive(Debug, Clone)]
struct SessionEntry {
    conn: Connection,
    group: Option<GroupName>,
}

/// UserId -> live connections. A user key exists only while it has at least
/// one connection.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    users: Arc<RwLock<HashMap<UserId, HashMap<ConnectionId, SessionEntry>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under `user_id`. Returns `true` when this is the
    /// user's first live connection (the user just came online).
    ///
    /// On that transition `online` is queued to every other user's
    /// connections before the lock is released, so presence frames reach
    /// each peer in the same order as the transitions themselves.
    pub async fn attach(
        &self,
        user_id: &UserId,
        conn: &Connection,
        online: Option<&Arc<str>>,
    ) -> bool {
        let mut users = self.users.write().await;
        let conns = users.entry(user_id.clone()).or_default();
        let came_online = conns.is_empty();
        conns.entry(conn.id()).or_insert_with(|| SessionEntry {
            conn: conn.clone(),
            group: None,
        });
        if came_online {
            if let Some(frame) = online {
                notify_others(&users, user_id, frame);
            }
        }
        came_online
    }

    /// Drop `conn_id` from `user_id`. Returns `true` when that was the user's
    /// last connection and the user key is gone (the user went offline), in
    /// which case `offline` is queued to every other user under the lock.
    pub async fn detach(
        &self,
        user_id: &UserId,
        conn_id: ConnectionId,
        offline: Option<&Arc<str>>,
    ) -> bool {
        let mut users = self.users.write().await;
        let Some(conns) = users.get_mut(user_id) else {
            return false;
        };
        if conns.remove(&conn_id).is_none() {
            return false;
        }
        if !conns.is_empty() {
            return false;
        }
        users.remove(user_id);
        debug!(user = %user_id, "User has no connections left");
        if let Some(frame) = offline {
            notify_others(&users, user_id, frame);
        }
        true
    }

    #[cfg(test)]
    pub async fn add_connection(&self, user_id: &UserId, conn: &Connection) -> bool {
        self.attach(user_id, conn, None).await
    }

    #[cfg(test)]
    pub async fn remove_connection(&self, user_id: &UserId, conn_id: ConnectionId) -> bool {
        self.detach(user_id, conn_id, None).await
    }

    /// Point-in-time snapshot of a user's connections.
    pub async fn connections_for(&self, user_id: &UserId) -> Vec<Connection> {
        self.users
            .read()
            .await
            .get(user_id)
            .map(|conns| conns.values().map(|entry| entry.conn.clone()).collect())
            .unwrap_or_default()
    }

    /// Record the channel a connection currently belongs to.
    pub async fn set_group(
        &self,
        user_id: &UserId,
        conn_id: ConnectionId,
        group: Option<GroupName>,
    ) {
        let mut users = self.users.write().await;
        if let Some(entry) = users
            .get_mut(user_id)
            .and_then(|conns| conns.get_mut(&conn_id))
        {
            entry.group = group;
        }
    }

    /// Whether any live connection of `user_id` currently sits in `group`.
    pub async fn in_group(&self, user_id: &UserId, group: &GroupName) -> bool {
        self.users
            .read()
            .await
            .get(user_id)
            .is_some_and(|conns| conns.values().any(|entry| entry.group.as_ref() == Some(group)))
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.users.read().await.values().map(HashMap::len).sum()
    }
}

fn notify_others(
    users: &HashMap<UserId, HashMap<ConnectionId, SessionEntry>>,
    user_id: &UserId,
    frame: &Arc<str>,
) {
    for (_, conns) in users.iter().filter(|(other, _)| *other != user_id) {
        for entry in conns.values() {
            entry.conn.send_text(Arc::clone(frame));
        }
    }
}
