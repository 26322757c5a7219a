use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use buz_shared::{GroupName, UserId};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::sessions::SessionRegistry;

/// Channel name -> member users. A group exists only while it has members.
#[derive(Clone, Default)]
pub struct GroupRegistry {
    groups: Arc<RwLock<HashMap<GroupName, HashSet<UserId>>>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a group (creates it if missing). Returns `true` if the user was
    /// not already a member.
    pub async fn join(&self, group: &GroupName, user_id: &UserId) -> bool {
        let mut groups = self.groups.write().await;
        let members = groups.entry(group.clone()).or_default();
        let added = members.insert(user_id.clone());
        if added {
            debug!(
                group = %group,
                user = %user_id,
                members = members.len(),
                "Member joined group"
            );
        }
        added
    }

    /// Leave a group. Auto-deletes the group if it becomes empty. Returns
    /// `true` if the user was a member.
    #[cfg(test)]
    pub async fn leave(&self, group: &GroupName, user_id: &UserId) -> bool {
        let mut groups = self.groups.write().await;
        Self::remove_member(&mut groups, group, user_id)
    }

    /// Leave on behalf of one connection: the user stays a member while any
    /// other of its connections still sits in `group`. The session check runs
    /// under this registry's write lock so a concurrent join by a sibling
    /// connection cannot be lost.
    pub async fn release(
        &self,
        group: &GroupName,
        user_id: &UserId,
        sessions: &SessionRegistry,
    ) -> bool {
        let mut groups = self.groups.write().await;
        if sessions.in_group(user_id, group).await {
            return false;
        }
        Self::remove_member(&mut groups, group, user_id)
    }

    fn remove_member(
        groups: &mut HashMap<GroupName, HashSet<UserId>>,
        group: &GroupName,
        user_id: &UserId,
    ) -> bool {
        let Some(members) = groups.get_mut(group) else {
            return false;
        };
        let removed = members.remove(user_id);
        if members.is_empty() {
            groups.remove(group);
            info!(group = %group, "Removed empty group");
        }
        removed
    }

    /// Snapshot of the members of `group`; empty if the group does not exist.
    pub async fn members_of(&self, group: &GroupName) -> HashSet<UserId> {
        self.groups
            .read()
            .await
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }
}
