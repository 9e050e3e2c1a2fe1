//! Wire protocol for the chat WebSocket.
//!
//! Every frame is a JSON object with a `type` discriminator. Both directions
//! are closed tagged enums: unknown inbound tags are rejected explicitly with
//! `UNKNOWN_EVENT` rather than falling through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Notification};

/// Inbound events from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    SendMessage {
        #[serde(default)]
        conversation_id: Option<Uuid>,
        /// Auto-creates the conversation when no conversation_id is given.
        #[serde(default)]
        recipient_id: Option<Uuid>,
        text: String,
        #[serde(default)]
        attachments: Option<Vec<String>>,
    },
    Typing {
        #[serde(default)]
        conversation_id: Option<Uuid>,
        #[serde(default = "default_true")]
        is_typing: bool,
    },
    ReadReceipt {
        #[serde(default)]
        conversation_id: Option<Uuid>,
        #[serde(default)]
        message_ids: Option<Vec<Uuid>>,
    },
    Reconnect {},
    GetMissedMessages {
        conversation_id: Uuid,
    },
    NotificationsSync {
        #[serde(default)]
        unread_only: bool,
        #[serde(default)]
        limit: Option<i64>,
    },
    EditMessage {
        message_id: Uuid,
        text: String,
    },
    DeleteMessage {
        message_id: Uuid,
    },
    Ping {},
}

fn default_true() -> bool {
    true
}

const KNOWN_EVENT_TYPES: &[&str] = &[
    "authenticate",
    "send_message",
    "typing",
    "read_receipt",
    "reconnect",
    "get_missed_messages",
    "notifications_sync",
    "edit_message",
    "delete_message",
    "ping",
];

/// Error codes carried on `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    Forbidden,
    ValidationError,
    AuthRequired,
    UnknownEvent,
    InternalError,
    NotFound,
    ReconnectFailed,
}

#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Parse a raw text frame into a [`ClientEvent`], distinguishing malformed
/// payloads (`VALIDATION_ERROR`) from well-formed frames carrying a tag
/// outside the closed set (`UNKNOWN_EVENT`).
pub fn parse_client_event(raw: &str) -> Result<ClientEvent, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|_| ProtocolError::new(ErrorCode::ValidationError, "Invalid JSON format"))?;

    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_owned)
        .ok_or_else(|| ProtocolError::new(ErrorCode::ValidationError, "missing event type"))?;

    if !KNOWN_EVENT_TYPES.contains(&tag.as_str()) {
        return Err(ProtocolError::new(
            ErrorCode::UnknownEvent,
            format!("Unknown event type: {tag}"),
        ));
    }

    serde_json::from_value(value)
        .map_err(|e| ProtocolError::new(ErrorCode::ValidationError, e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Message fields as they appear on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub text: String,
    pub attachments: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
    pub is_deleted: bool,
}

impl From<&Message> for MessagePayload {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            text: message.text.clone(),
            attachments: message.attachments.clone(),
            timestamp: message.created_at,
            is_read: message.is_read,
            read_at: message.read_at,
            is_edited: message.is_edited,
            is_deleted: message.is_deleted,
        }
    }
}

/// Outbound events from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AuthRequired {
        message: String,
    },
    Authenticated {
        user_id: Uuid,
        conversation_id: Option<Uuid>,
    },
    Error {
        code: ErrorCode,
        error: String,
    },
    Message {
        message: MessagePayload,
    },
    MessageSent {
        message: MessagePayload,
    },
    MissedMessage {
        conversation_id: Uuid,
        message: MessagePayload,
    },
    MissedMessages {
        conversation_id: Uuid,
        messages: Vec<MessagePayload>,
    },
    Typing {
        user_id: Uuid,
        is_typing: bool,
    },
    ReadReceipt {
        user_id: Uuid,
        conversation_id: Uuid,
        message_count: u64,
    },
    Presence {
        user_id: Uuid,
        status: PresenceStatus,
    },
    Notification {
        notification: Notification,
    },
    NotificationsSync {
        notifications: Vec<Notification>,
    },
    MessageEdited {
        message: MessagePayload,
    },
    MessageDeleted {
        message: MessagePayload,
    },
    Pong,
}

/// Events carried between sessions over the group registry. In-process only;
/// each receiving session decides what reaches its own transport.
#[derive(Debug, Clone)]
pub enum GroupEvent {
    MessageNew {
        message: MessagePayload,
    },
    MessageEdited {
        message: MessagePayload,
    },
    MessageDeleted {
        message: MessagePayload,
    },
    Typing {
        user_id: Uuid,
        is_typing: bool,
    },
    ReadReceipt {
        user_id: Uuid,
        conversation_id: Uuid,
        message_count: u64,
    },
    Presence {
        user_id: Uuid,
        status: PresenceStatus,
    },
    Notification {
        notification: Notification,
    },
}
