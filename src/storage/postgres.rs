//! Postgres store adapters backed by sqlx.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use std::collections::HashMap;
use uuid::Uuid;

use super::{validated_attachments, validated_text, MessageStore, NotificationStore};
use crate::error::{AppError, AppResult};
use crate::models::message::DELETED_TEXT;
use crate::models::{Conversation, Message, Notification, NotificationKind};

fn conversation_from_row(row: &PgRow) -> Conversation {
    let user_a: Uuid = row.get("user_a");
    let user_b: Uuid = row.get("user_b");
    let unread_a: i64 = row.get("unread_a");
    let unread_b: i64 = row.get("unread_b");

    Conversation {
        id: row.get("id"),
        user_a,
        user_b,
        last_message: row.get("last_message"),
        last_message_at: row.get("last_message_at"),
        unread: HashMap::from([(user_a, unread_a), (user_b, unread_b)]),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn message_from_row(row: &PgRow) -> Message {
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        text: row.get("text"),
        attachments: row.get("attachments"),
        created_at: row.get("created_at"),
        is_read: row.get("is_read"),
        read_at: row.get("read_at"),
        is_edited: row.get("is_edited"),
        edited_at: row.get("edited_at"),
        is_deleted: row.get("is_deleted"),
        deleted_at: row.get("deleted_at"),
    }
}

fn notification_from_row(row: &PgRow) -> AppResult<Notification> {
    let kind: String = row.get("kind");
    let kind = NotificationKind::parse(&kind).ok_or(AppError::Internal)?;
    Ok(Notification {
        id: row.get("id"),
        user_id: row.get("user_id"),
        kind,
        title: row.get("title"),
        body: row.get("body"),
        related_id: row.get("related_id"),
        is_read: row.get("is_read"),
        read_at: row.get("read_at"),
        created_at: row.get("created_at"),
    })
}

const CONVERSATION_COLUMNS: &str =
    "id, user_a, user_b, last_message, last_message_at, unread_a, unread_b, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, text, attachments, created_at, \
     is_read, read_at, is_edited, edited_at, is_deleted, deleted_at";

#[derive(Clone)]
pub struct PgMessageStore {
    pool: Pool<Postgres>,
}

impl PgMessageStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn fetch_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    async fn fetch_message(&self, id: Uuid) -> AppResult<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(message_from_row))
    }

    async fn get_or_create(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        if a == b {
            return Err(AppError::Validation(
                "conversation requires two distinct participants".into(),
            ));
        }
        let (user_a, user_b) = Conversation::canonical_pair(a, b);

        // Concurrent calls for the same pair race on the unique index and
        // converge on whichever row won.
        sqlx::query(
            "INSERT INTO conversations (id, user_a, user_b) VALUES ($1, $2, $3) \
             ON CONFLICT (user_a, user_b) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(user_a)
        .bind(user_b)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE user_a = $1 AND user_b = $2"
        ))
        .bind(user_a)
        .bind(user_b)
        .fetch_one(&self.pool)
        .await?;
        Ok(conversation_from_row(&row))
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn get_or_create_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        self.get_or_create(a, b).await
    }

    async fn conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        self.fetch_conversation(id).await
    }

    async fn conversations_for(&self, user: Uuid) -> AppResult<Vec<Conversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE user_a = $1 OR user_b = $1 ORDER BY updated_at DESC"
        ))
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(conversation_from_row).collect())
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

        let conversation = match conversation_id {
            Some(id) => {
                let conversation = self.fetch_conversation(id).await?.ok_or(AppError::NotFound)?;
                if !conversation.is_participant(sender) {
                    return Err(AppError::Forbidden);
                }
                conversation
            }
            None => {
                let recipient = recipient.ok_or_else(|| {
                    AppError::Validation(
                        "recipient_id is required when conversation_id is not provided".into(),
                    )
                })?;
                self.get_or_create(sender, recipient).await?
            }
        };

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, text, attachments, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(conversation.id)
        .bind(sender)
        .bind(&text)
        .bind(&attachments)
        .bind(now)
        .execute(&self.pool)
        .await?;

        // Last-message display plus the peer's unread counter in one pass.
        // Not transactional with the insert above; recovery re-derives from
        // message timestamps, so a crash in between loses no messages.
        sqlx::query(
            "UPDATE conversations SET \
                last_message = $2, \
                last_message_at = $3, \
                updated_at = $3, \
                unread_a = unread_a + CASE WHEN user_a <> $4 THEN 1 ELSE 0 END, \
                unread_b = unread_b + CASE WHEN user_b <> $4 THEN 1 ELSE 0 END \
             WHERE id = $1",
        )
        .bind(conversation.id)
        .bind(&text)
        .bind(now)
        .bind(sender)
        .execute(&self.pool)
        .await?;

        Ok(Message {
            id,
            conversation_id: conversation.id,
            sender_id: sender,
            text,
            attachments,
            created_at: now,
            is_read: false,
            read_at: None,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
        })
    }

    async fn message(&self, id: Uuid) -> AppResult<Option<Message>> {
        self.fetch_message(id).await
    }

    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = $1 AND created_at > $2 \
             ORDER BY created_at ASC LIMIT $3"
        ))
        .bind(conversation_id)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn update_message(&self, id: Uuid, sender: Uuid, text: &str) -> AppResult<Message> {
        let text = validated_text(text)?;
        let mut message = self.fetch_message(id).await?.ok_or(AppError::NotFound)?;
        if message.sender_id != sender {
            return Err(AppError::Forbidden);
        }

        let now = Utc::now();
        sqlx::query("UPDATE messages SET text = $1, is_edited = TRUE, edited_at = $2 WHERE id = $3")
            .bind(&text)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;

        // Refresh the conversation display only when this was the last message
        sqlx::query(
            "UPDATE conversations SET last_message = $1, updated_at = $2 \
             WHERE id = $3 AND last_message_at = $4",
        )
        .bind(&text)
        .bind(now)
        .bind(message.conversation_id)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        message.text = text;
        message.is_edited = true;
        message.edited_at = Some(now);
        Ok(message)
    }

    async fn delete_message(&self, id: Uuid, sender: Uuid) -> AppResult<Message> {
        let mut message = self.fetch_message(id).await?.ok_or(AppError::NotFound)?;
        if message.sender_id != sender {
            return Err(AppError::Forbidden);
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE messages SET is_deleted = TRUE, deleted_at = $1, text = $2, attachments = '{}' \
             WHERE id = $3",
        )
        .bind(now)
        .bind(DELETED_TEXT)
        .bind(id)
        .execute(&self.pool)
        .await?;

        // Recompute the display from the newest surviving message, or clear it
        sqlx::query(
            "UPDATE conversations c SET \
                last_message = newest.text, \
                last_message_at = newest.created_at, \
                updated_at = $2 \
             FROM (SELECT $1::uuid AS conversation_id) target \
             LEFT JOIN LATERAL ( \
                 SELECT text, created_at FROM messages \
                 WHERE conversation_id = $1 AND is_deleted = FALSE \
                 ORDER BY created_at DESC LIMIT 1 \
             ) newest ON TRUE \
             WHERE c.id = target.conversation_id",
        )
        .bind(message.conversation_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        message.text = DELETED_TEXT.to_string();
        message.attachments.clear();
        message.is_deleted = true;
        message.deleted_at = Some(now);
        Ok(message)
    }

    async fn mark_message_read(&self, id: Uuid) -> AppResult<()> {
        let result = sqlx::query("UPDATE messages SET is_read = TRUE, read_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn mark_conversation_read(&self, conversation_id: Uuid, user: Uuid) -> AppResult<u64> {
        if self.fetch_conversation(conversation_id).await?.is_none() {
            return Err(AppError::NotFound);
        }

        let result = sqlx::query(
            "UPDATE messages SET is_read = TRUE, read_at = $1 \
             WHERE conversation_id = $2 AND sender_id <> $3 AND is_read = FALSE",
        )
        .bind(Utc::now())
        .bind(conversation_id)
        .bind(user)
        .execute(&self.pool)
        .await?;

        self.reset_unread(conversation_id, user).await?;
        Ok(result.rows_affected())
    }

    async fn reset_unread(&self, conversation_id: Uuid, user: Uuid) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE conversations SET \
                unread_a = CASE WHEN user_a = $2 THEN 0 ELSE unread_a END, \
                unread_b = CASE WHEN user_b = $2 THEN 0 ELSE unread_b END \
             WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(user)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn touch_last_seen(&self, user: Uuid) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO user_presence (user_id, last_seen) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO UPDATE SET last_seen = EXCLUDED.last_seen",
        )
        .bind(user)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_seen(&self, user: Uuid) -> AppResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_seen FROM user_presence WHERE user_id = $1")
            .bind(user)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("last_seen")))
    }
}

#[derive(Clone)]
pub struct PgNotificationStore {
    pool: Pool<Postgres>,
}

impl PgNotificationStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
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

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO notifications (id, user_id, kind, title, body, related_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(user)
        .bind(kind.as_str())
        .bind(title)
        .bind(body)
        .bind(related_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Notification {
            id,
            user_id: user,
            kind,
            title: title.to_string(),
            body: body.to_string(),
            related_id,
            is_read: false,
            read_at: None,
            created_at: now,
        })
    }

    async fn for_user(
        &self,
        user: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> AppResult<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT id, user_id, kind, title, body, related_id, is_read, read_at, created_at \
             FROM notifications \
             WHERE user_id = $1 AND (NOT $2 OR is_read = FALSE) \
             ORDER BY created_at DESC LIMIT $3",
        )
        .bind(user)
        .bind(unread_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn mark_read(&self, id: Uuid) -> AppResult<()> {
        let result =
            sqlx::query("UPDATE notifications SET is_read = TRUE, read_at = $1 WHERE id = $2")
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn mark_all_read(&self, user: Uuid) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = TRUE, read_at = $1 \
             WHERE user_id = $2 AND is_read = FALSE",
        )
        .bind(Utc::now())
        .bind(user)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, id: Uuid, owner: Uuid) -> AppResult<()> {
        let row = sqlx::query("SELECT user_id FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        let user_id: Uuid = row.get("user_id");
        if user_id != owner {
            return Err(AppError::Forbidden);
        }

        sqlx::query("DELETE FROM notifications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unread_count(&self, user: Uuid) -> AppResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND is_read = FALSE",
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}
