use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{Conversation, Message, Notification, NotificationKind};

pub mod memory;
pub mod postgres;

pub(crate) fn validated_text(text: &str) -> AppResult<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(crate::error::AppError::Validation(
            "message text cannot be empty".into(),
        ));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn validated_attachments(attachments: &[String]) -> AppResult<Vec<String>> {
    for url in attachments {
        if url.trim().is_empty() {
            return Err(crate::error::AppError::Validation(
                "all attachment URLs must be non-empty strings".into(),
            ));
        }
    }
    Ok(attachments.to_vec())
}

/// Persistence contract for conversations and messages, the source of truth
/// for content and ordering.
///
/// `create_message` performs the conversation-side bookkeeping (last-message
/// fields, peer unread increment) but deliberately not notification creation;
/// the caller drives that step, and the overall send sequence is not atomic.
/// Reconnect recovery is re-derived from `messages_after`, so a partially
/// applied sequence never loses a message.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Returns the one conversation for the unordered `{a, b}` pair, creating
    /// it if absent. Idempotent under concurrent calls; call order of the
    /// participants never produces two records.
    async fn get_or_create_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Conversation>;

    async fn conversation(&self, id: Uuid) -> AppResult<Option<Conversation>>;

    /// All conversations the user participates in, most recently updated first.
    async fn conversations_for(&self, user: Uuid) -> AppResult<Vec<Conversation>>;

    /// Persists a message. When `conversation_id` is `None` the conversation
    /// is auto-created from `(sender, recipient)`. Rejects empty text, empty
    /// attachment entries and senders that are not participants; updates the
    /// conversation's last-message fields and increments the peer's unread
    /// counter.
    async fn create_message(
        &self,
        conversation_id: Option<Uuid>,
        sender: Uuid,
        recipient: Option<Uuid>,
        text: &str,
        attachments: &[String],
    ) -> AppResult<Message>;

    async fn message(&self, id: Uuid) -> AppResult<Option<Message>>;

    /// Messages strictly newer than `after`, oldest first, capped at `limit`.
    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Message>>;

    /// Rewrites a message's text. Only the original sender may edit; any
    /// other caller gets `Forbidden` and the message is untouched. Refreshes
    /// the conversation's last-message text when the edited message is the
    /// current last message.
    async fn update_message(&self, id: Uuid, sender: Uuid, text: &str) -> AppResult<Message>;

    /// Soft-deletes a message: text becomes the fixed tombstone, attachments
    /// are cleared, the row and timestamp remain. Sender-only, like
    /// `update_message`. Recomputes the conversation's last-message display
    /// from the newest surviving non-deleted message, or clears it.
    async fn delete_message(&self, id: Uuid, sender: Uuid) -> AppResult<Message>;

    async fn mark_message_read(&self, id: Uuid) -> AppResult<()>;

    /// Marks every unread message in the conversation not sent by `user` as
    /// read and resets `user`'s unread counter. Returns how many were marked.
    async fn mark_conversation_read(&self, conversation_id: Uuid, user: Uuid) -> AppResult<u64>;

    async fn reset_unread(&self, conversation_id: Uuid, user: Uuid) -> AppResult<()>;

    async fn touch_last_seen(&self, user: Uuid) -> AppResult<()>;

    async fn last_seen(&self, user: Uuid) -> AppResult<Option<DateTime<Utc>>>;
}

/// Persistence for user-facing notification records, independent of any
/// delivery channel.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create(
        &self,
        user: Uuid,
        kind: NotificationKind,
        title: &str,
        body: &str,
        related_id: Option<Uuid>,
    ) -> AppResult<Notification>;

    /// Notifications for `user`, newest first.
    async fn for_user(
        &self,
        user: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> AppResult<Vec<Notification>>;

    async fn mark_read(&self, id: Uuid) -> AppResult<()>;

    async fn mark_all_read(&self, user: Uuid) -> AppResult<u64>;

    /// Owner-only delete; any other caller gets `Forbidden`.
    async fn delete(&self, id: Uuid, owner: Uuid) -> AppResult<()>;

    async fn unread_count(&self, user: Uuid) -> AppResult<u64>;
}
