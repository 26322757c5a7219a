//! Fan-out of one message to every connection of every group member.
//!
//! Delivery is best effort and independent per recipient: a broken or slow
//! connection loses its copy and lowers the returned count, nothing more.

use std::sync::Arc;

use buz_shared::{GroupName, ServerMessage, UserId};
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::groups::GroupRegistry;
use crate::sessions::SessionRegistry;

#[derive(Clone)]
pub struct BroadcastEngine {
    sessions: SessionRegistry,
    groups: GroupRegistry,
}

impl BroadcastEngine {
    pub fn new(sessions: SessionRegistry, groups: GroupRegistry) -> Self {
        Self { sessions, groups }
    }

    /// Deliver `msg` to the members of `group`, skipping `sender` unless
    /// `include_sender` is set. Returns the number of connections written to.
    pub async fn broadcast(
        &self,
        group: &GroupName,
        msg: &ServerMessage,
        sender: &UserId,
        include_sender: bool,
    ) -> usize {
        let exclude = (!include_sender).then_some(sender);
        self.notify_group(group, msg, exclude).await
    }

    /// Deliver `msg` to every member of `group` except `exclude`.
    pub async fn notify_group(
        &self,
        group: &GroupName,
        msg: &ServerMessage,
        exclude: Option<&UserId>,
    ) -> usize {
        let Some(frame) = encode(msg) else {
            return 0;
        };

        // Snapshot taken under the group lock; membership changes after this
        // point affect the next broadcast, not this one.
        let members = self.groups.members_of(group).await;
        let mut delivered = 0;
        for member in members.iter().filter(|m| Some(*m) != exclude) {
            let conns = self.sessions.connections_for(member).await;
            delivered += deliver(&conns, &frame);
        }

        debug!(
            group = %group,
            members = members.len(),
            delivered,
            "Group fan-out complete"
        );
        delivered
    }

    /// Deliver an already-built JSON object to every connection of one
    /// user. Returns the number of connections written to.
    pub async fn forward(&self, user_id: &UserId, payload: &Value) -> usize {
        let frame: Arc<str> = Arc::from(payload.to_string());
        let conns = self.sessions.connections_for(user_id).await;
        let delivered = deliver(&conns, &frame);
        debug!(user = %user_id, delivered, "Direct forward complete");
        delivered
    }
}

pub(crate) fn encode(msg: &ServerMessage) -> Option<Arc<str>> {
    match msg.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(error = %e, "Failed to serialize broadcast message");
            None
        }
    }
}

fn deliver(conns: &[Connection], frame: &Arc<str>) -> usize {
    conns
        .iter()
        .filter(|conn| conn.send_text(Arc::clone(frame)))
        .count()
}
