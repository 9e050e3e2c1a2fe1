//! Notification creation and delivery.
//!
//! The single inbound entry point other subsystems (matching, session
//! booking, payments) use to raise a user-facing event. Durability precedes
//! delivery: the record is persisted first, then pushed through the group
//! registry to the recipient's personal group. A recipient with no live
//! connection simply picks the record up during its next reconciliation.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{Notification, NotificationKind};
use crate::storage::NotificationStore;
use crate::websocket::protocol::GroupEvent;
use crate::websocket::{Group, GroupRegistry};

pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    registry: GroupRegistry,
}

impl NotificationService {
    pub fn new(store: Arc<dyn NotificationStore>, registry: GroupRegistry) -> Self {
        Self { store, registry }
    }

    /// Persist a notification, then best-effort push it to the recipient's
    /// personal group. Store failures propagate; delivery never does.
    pub async fn send(
        &self,
        user: Uuid,
        kind: NotificationKind,
        title: &str,
        body: &str,
        related_id: Option<Uuid>,
    ) -> AppResult<Notification> {
        let notification = self.store.create(user, kind, title, body, related_id).await?;

        self.registry
            .send(
                Group::User(user),
                &GroupEvent::Notification {
                    notification: notification.clone(),
                },
            )
            .await;
        tracing::debug!(user_id = %user, kind = %kind.as_str(), "notification dispatched");

        Ok(notification)
    }

    pub async fn list(
        &self,
        user: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> AppResult<Vec<Notification>> {
        self.store.for_user(user, unread_only, limit).await
    }
}
