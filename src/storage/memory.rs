//! In-memory store adapters.
//!
//! Back the store traits with plain maps behind an async lock. Used by the
//! test suite and by single-node development setups; the Postgres adapters
//! mirror these semantics query for query.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{validated_attachments, validated_text, MessageStore, NotificationStore};
use crate::error::{AppError, AppResult};
use crate::models::message::DELETED_TEXT;
use crate::models::{Conversation, Message, Notification, NotificationKind};

#[derive(Default)]
struct MessageState {
    conversations: HashMap<Uuid, Conversation>,
    // canonical (user_a, user_b) -> conversation id
    pair_index: HashMap<(Uuid, Uuid), Uuid>,
    messages: HashMap<Uuid, Message>,
    by_conversation: HashMap<Uuid, Vec<Uuid>>,
    last_seen: HashMap<Uuid, DateTime<Utc>>,
}

#[derive(Default, Clone)]
pub struct InMemoryMessageStore {
    state: Arc<RwLock<MessageState>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn get_or_create_locked(state: &mut MessageState, a: Uuid, b: Uuid) -> AppResult<Conversation> {
    if a == b {
        return Err(AppError::Validation(
            "conversation requires two distinct participants".into(),
        ));
    }
    let pair = Conversation::canonical_pair(a, b);
    if let Some(id) = state.pair_index.get(&pair) {
        return state
            .conversations
            .get(id)
            .cloned()
            .ok_or(AppError::Internal);
    }

    let now = Utc::now();
    let conversation = Conversation {
        id: Uuid::new_v4(),
        user_a: pair.0,
        user_b: pair.1,
        last_message: None,
        last_message_at: None,
        unread: HashMap::from([(pair.0, 0), (pair.1, 0)]),
        created_at: now,
        updated_at: now,
    };
    state.pair_index.insert(pair, conversation.id);
    state
        .conversations
        .insert(conversation.id, conversation.clone());
    Ok(conversation)
}

/// Recompute a conversation's last-message display from the newest surviving
/// non-deleted message.
fn refresh_last_message(state: &mut MessageState, conversation_id: Uuid) {
    let newest = state
        .by_conversation
        .get(&conversation_id)
        .and_then(|ids| {
            ids.iter()
                .filter_map(|id| state.messages.get(id))
                .filter(|m| !m.is_deleted)
                .max_by_key(|m| m.created_at)
        })
        .map(|m| (m.text.clone(), m.created_at));

    if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
        match newest {
            Some((text, at)) => {
                conversation.last_message = Some(text);
                conversation.last_message_at = Some(at);
            }
            None => {
                conversation.last_message = None;
                conversation.last_message_at = None;
            }
        }
        conversation.updated_at = Utc::now();
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn get_or_create_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        let mut state = self.state.write().await;
        get_or_create_locked(&mut state, a, b)
    }

    async fn conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        let state = self.state.read().await;
        Ok(state.conversations.get(&id).cloned())
    }

    async fn conversations_for(&self, user: Uuid) -> AppResult<Vec<Conversation>> {
        let state = self.state.read().await;
        let mut conversations: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.is_participant(user))
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn create_message(
        &self,
        conversation_id: Option<Uuid>,
        sender: Uuid,
        recipient: Option<Uuid>,
        text: &str,
        attachments: &[String],
    ) -> AppResult<Message> {
        let text = validated_text(text)?;
        let attachments = validated_attachments(attachments)?;

        let mut state = self.state.write().await;
        let conversation_id = match conversation_id {
            Some(id) => {
                let conversation = state.conversations.get(&id).ok_or(AppError::NotFound)?;
                if !conversation.is_participant(sender) {
                    return Err(AppError::Forbidden);
                }
                id
            }
            None => {
                let recipient = recipient.ok_or_else(|| {
                    AppError::Validation(
                        "recipient_id is required when conversation_id is not provided".into(),
                    )
                })?;
                get_or_create_locked(&mut state, sender, recipient)?.id
            }
        };

        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: sender,
            text: text.clone(),
            attachments,
            created_at: now,
            is_read: false,
            read_at: None,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
        };
        state.messages.insert(message.id, message.clone());
        state
            .by_conversation
            .entry(conversation_id)
            .or_default()
            .push(message.id);

        if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
            conversation.last_message = Some(text);
            conversation.last_message_at = Some(now);
            conversation.updated_at = now;
            if let Some(peer) = conversation.peer_of(sender) {
                *conversation.unread.entry(peer).or_insert(0) += 1;
            }
        }

        Ok(message)
    }

    async fn message(&self, id: Uuid) -> AppResult<Option<Message>> {
        let state = self.state.read().await;
        Ok(state.messages.get(&id).cloned())
    }

    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let state = self.state.read().await;
        let mut messages: Vec<Message> = state
            .by_conversation
            .get(&conversation_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.messages.get(id))
                    .filter(|m| m.created_at > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        messages.truncate(limit.max(0) as usize);
        Ok(messages)
    }

    async fn update_message(&self, id: Uuid, sender: Uuid, text: &str) -> AppResult<Message> {
        let text = validated_text(text)?;
        let mut state = self.state.write().await;

        let existing = state.messages.get(&id).ok_or(AppError::NotFound)?;
        if existing.sender_id != sender {
            return Err(AppError::Forbidden);
        }
        let conversation_id = existing.conversation_id;
        let created_at = existing.created_at;

        let now = Utc::now();
        let updated = {
            let message = state.messages.get_mut(&id).ok_or(AppError::NotFound)?;
            message.text = text.clone();
            message.is_edited = true;
            message.edited_at = Some(now);
            message.clone()
        };

        // Refresh the conversation display only when this was the last message
        if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
            if conversation.last_message_at == Some(created_at) {
                conversation.last_message = Some(text);
                conversation.updated_at = now;
            }
        }

        Ok(updated)
    }

    async fn delete_message(&self, id: Uuid, sender: Uuid) -> AppResult<Message> {
        let mut state = self.state.write().await;

        let existing = state.messages.get(&id).ok_or(AppError::NotFound)?;
        if existing.sender_id != sender {
            return Err(AppError::Forbidden);
        }
        let conversation_id = existing.conversation_id;

        let now = Utc::now();
        let deleted = {
            let message = state.messages.get_mut(&id).ok_or(AppError::NotFound)?;
            message.text = DELETED_TEXT.to_string();
            message.attachments.clear();
            message.is_deleted = true;
            message.deleted_at = Some(now);
            message.clone()
        };

        refresh_last_message(&mut state, conversation_id);
        Ok(deleted)
    }

    async fn mark_message_read(&self, id: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        let message = state.messages.get_mut(&id).ok_or(AppError::NotFound)?;
        message.is_read = true;
        message.read_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_conversation_read(&self, conversation_id: Uuid, user: Uuid) -> AppResult<u64> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&conversation_id) {
            return Err(AppError::NotFound);
        }

        let ids: Vec<Uuid> = state
            .by_conversation
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default();
        let now = Utc::now();
        let mut count = 0u64;
        for id in ids {
            if let Some(message) = state.messages.get_mut(&id) {
                if message.sender_id != user && !message.is_read {
                    message.is_read = true;
                    message.read_at = Some(now);
                    count += 1;
                }
            }
        }

        if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
            conversation.unread.insert(user, 0);
        }
        Ok(count)
    }

    async fn reset_unread(&self, conversation_id: Uuid, user: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        conversation.unread.insert(user, 0);
        Ok(())
    }

    async fn touch_last_seen(&self, user: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.last_seen.insert(user, Utc::now());
        Ok(())
    }

    async fn last_seen(&self, user: Uuid) -> AppResult<Option<DateTime<Utc>>> {
        let state = self.state.read().await;
        Ok(state.last_seen.get(&user).copied())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryNotificationStore {
    state: Arc<RwLock<HashMap<Uuid, Notification>>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn create(
        &self,
        user: Uuid,
        kind: NotificationKind,
        title: &str,
        body: &str,
        related_id: Option<Uuid>,
    ) -> AppResult<Notification> {
        let title = title.trim();
        let body = body.trim();
        if title.is_empty() {
            return Err(AppError::Validation("title is required".into()));
        }
        if body.is_empty() {
            return Err(AppError::Validation("body is required".into()));
        }

        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: user,
            kind,
            title: title.to_string(),
            body: body.to_string(),
            related_id,
            is_read: false,
            read_at: None,
            created_at: Utc::now(),
        };
        let mut state = self.state.write().await;
        state.insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn for_user(
        &self,
        user: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> AppResult<Vec<Notification>> {
        let state = self.state.read().await;
        let mut notifications: Vec<Notification> = state
            .values()
            .filter(|n| n.user_id == user && (!unread_only || !n.is_read))
            .cloned()
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        notifications.truncate(limit.max(0) as usize);
        Ok(notifications)
    }

    async fn mark_read(&self, id: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        let notification = state.get_mut(&id).ok_or(AppError::NotFound)?;
        notification.is_read = true;
        notification.read_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_all_read(&self, user: Uuid) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut count = 0u64;
        for notification in state.values_mut() {
            if notification.user_id == user && !notification.is_read {
                notification.is_read = true;
                notification.read_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete(&self, id: Uuid, owner: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        let notification = state.get(&id).ok_or(AppError::NotFound)?;
        if notification.user_id != owner {
            return Err(AppError::Forbidden);
        }
        state.remove(&id);
        Ok(())
    }

    async fn unread_count(&self, user: Uuid) -> AppResult<u64> {
        let state = self.state.read().await;
        Ok(state
            .values()
            .filter(|n| n.user_id == user && !n.is_read)
            .count() as u64)
    }
}
