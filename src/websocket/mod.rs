use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, RwLock};
use uuid::Uuid;

pub mod protocol;
pub mod session;

use protocol::GroupEvent;

/// Unique identifier for a connected session's registry membership.
///
/// Each connection gets one id when it is created, used for precise cleanup
/// when the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// A named broadcast channel. Conversation groups carry chat traffic;
/// user groups carry personal notification delivery. Both families ride the
/// same fan-out substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Conversation(Uuid),
    User(Uuid),
}

struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<GroupEvent>,
}

/// Concurrency-safe registry mapping a group to its currently-connected
/// subscribers. Sessions never hold references to each other; every
/// cross-session signal goes through here.
#[derive(Default, Clone)]
pub struct GroupRegistry {
    inner: Arc<RwLock<HashMap<Group, Vec<Subscriber>>>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber to a group. Idempotent: joining a group the
    /// subscriber already belongs to is a no-op.
    pub async fn join(&self, group: Group, id: SubscriberId, sender: UnboundedSender<GroupEvent>) {
        let mut guard = self.inner.write().await;
        let members = guard.entry(group).or_default();
        if members.iter().any(|s| s.id == id) {
            return;
        }
        members.push(Subscriber { id, sender });
        tracing::debug!(?group, subscriber = ?id, total = members.len(), "joined group");
    }

    /// Remove a subscriber from a group. Idempotent; empty group entries are
    /// dropped so the registry does not leak.
    pub async fn leave(&self, group: Group, id: SubscriberId) {
        let mut guard = self.inner.write().await;
        if let Some(members) = guard.get_mut(&group) {
            members.retain(|s| s.id != id);
            if members.is_empty() {
                guard.remove(&group);
            }
        }
    }

    /// Fan the event out to every current member. Best-effort: members whose
    /// channel has closed (mid-fan-out disconnects included) are pruned and
    /// never surface as an error to the caller.
    pub async fn send(&self, group: Group, event: &GroupEvent) {
        let mut guard = self.inner.write().await;
        if let Some(members) = guard.get_mut(&group) {
            let before = members.len();
            members.retain(|s| s.sender.send(event.clone()).is_ok());
            let after = members.len();
            if before != after {
                tracing::debug!(?group, pruned = before - after, active = after, "pruned dead subscribers");
            }
            if members.is_empty() {
                guard.remove(&group);
            }
        }
    }

    pub async fn member_count(&self, group: Group) -> usize {
        let guard = self.inner.read().await;
        guard.get(&group).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::protocol::PresenceStatus;
    use tokio::sync::mpsc::unbounded_channel;

    fn presence(user_id: Uuid) -> GroupEvent {
        GroupEvent::Presence {
            user_id,
            status: PresenceStatus::Online,
        }
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let registry = GroupRegistry::new();
        let group = Group::Conversation(Uuid::new_v4());
        let id = SubscriberId::new();
        let (tx, mut rx) = unbounded_channel();

        registry.join(group, id, tx.clone()).await;
        registry.join(group, id, tx).await;
        assert_eq!(registry.member_count(group).await, 1);

        registry.send(group, &presence(Uuid::new_v4())).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_reaches_all_members_and_skips_dead_ones() {
        let registry = GroupRegistry::new();
        let group = Group::User(Uuid::new_v4());

        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, rx_b) = unbounded_channel();
        registry.join(group, SubscriberId::new(), tx_a).await;
        registry.join(group, SubscriberId::new(), tx_b).await;

        // Simulate a member disconnecting mid-stream
        drop(rx_b);

        registry.send(group, &presence(Uuid::new_v4())).await;
        assert!(rx_a.try_recv().is_ok());
        assert_eq!(registry.member_count(group).await, 1);
    }

    #[tokio::test]
    async fn leave_removes_subscriber_and_empty_groups() {
        let registry = GroupRegistry::new();
        let group = Group::Conversation(Uuid::new_v4());
        let id = SubscriberId::new();
        let (tx, _rx) = unbounded_channel();

        registry.join(group, id, tx).await;
        registry.leave(group, id).await;
        assert_eq!(registry.member_count(group).await, 0);

        // Leaving again is harmless
        registry.leave(group, id).await;
    }

    #[tokio::test]
    async fn send_to_unknown_group_is_a_noop() {
        let registry = GroupRegistry::new();
        registry
            .send(Group::Conversation(Uuid::new_v4()), &presence(Uuid::new_v4()))
            .await;
    }
}
