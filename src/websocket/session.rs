//! Per-connection protocol state machine.
//!
//! Each live connection runs one [`SessionCore`] on its own task. The
//! transport feeds parsed client events in through a command channel; group
//! fan-out arrives on a second channel; everything the client should see
//! leaves through the outbound channel. Commands and group events are
//! processed sequentially in a single select loop, so session state never
//! needs a lock.

use std::collections::{HashMap, HashSet};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::NotificationKind;
use crate::state::AppState;
use crate::websocket::protocol::{
    ClientEvent, ErrorCode, GroupEvent, MessagePayload, PresenceStatus, ServerEvent,
};
use crate::websocket::{Group, SubscriberId};

/// Sentinel connection target for notification-only connections.
pub const NOTIFICATIONS_TARGET: &str = "notifications";

/// What the connection URL named: a specific conversation, or the sentinel
/// meaning "notifications only".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTarget {
    Conversation(Uuid),
    NotificationsOnly,
}

impl ConnectionTarget {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        if raw == NOTIFICATIONS_TARGET {
            return Ok(Self::NotificationsOnly);
        }
        Uuid::parse_str(raw)
            .map(Self::Conversation)
            .map_err(|_| AppError::Validation(format!("invalid conversation target: {raw}")))
    }

    pub fn conversation(&self) -> Option<Uuid> {
        match self {
            Self::Conversation(id) => Some(*id),
            Self::NotificationsOnly => None,
        }
    }
}

/// Why the server is closing the socket. Distinct close codes let a client
/// tell "retry with a new token" apart from "not allowed here".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unauthorized,
    Forbidden,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            Self::Unauthorized => 4001,
            Self::Forbidden => 4003,
        }
    }
}

/// Frames handed to the transport for delivery.
#[derive(Debug)]
pub enum Outbound {
    Event(ServerEvent),
    Close(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionAuth {
    Unauthenticated,
    Authenticated { user_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Continue,
    Close(CloseReason),
}

pub struct SessionCore {
    id: SubscriberId,
    state: AppState,
    target: ConnectionTarget,
    auth: SessionAuth,
    joined: HashSet<Group>,
    /// Per-conversation replay marker.
    last_seen: HashMap<Uuid, DateTime<Utc>>,
    /// Message ids already delivered over this connection.
    delivered: HashSet<Uuid>,
    outbound: UnboundedSender<Outbound>,
    group_tx: UnboundedSender<GroupEvent>,
    group_rx: Option<UnboundedReceiver<GroupEvent>>,
}

impl SessionCore {
    pub fn new(state: AppState, target: ConnectionTarget, outbound: UnboundedSender<Outbound>) -> Self {
        let (group_tx, group_rx) = unbounded_channel();
        Self {
            id: SubscriberId::new(),
            state,
            target,
            auth: SessionAuth::Unauthenticated,
            joined: HashSet::new(),
            last_seen: HashMap::new(),
            delivered: HashSet::new(),
            outbound,
            group_tx,
            group_rx: Some(group_rx),
        }
    }

    /// Drive the session until the transport goes away or a fatal
    /// authentication failure closes it. Connections without a token wait in
    /// the unauthenticated state after announcing `auth_required`.
    pub async fn run(mut self, initial_token: Option<String>, mut commands: UnboundedReceiver<ClientEvent>) {
        let Some(mut groups) = self.group_rx.take() else {
            return;
        };

        match initial_token {
            Some(token) => {
                if let SessionStatus::Close(reason) = self.authenticate(&token).await {
                    let _ = self.outbound.send(Outbound::Close(reason));
                    self.disconnect().await;
                    return;
                }
            }
            None => self.send_event(ServerEvent::AuthRequired {
                message: "Please authenticate by sending an authenticate event with your token"
                    .into(),
            }),
        }

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(event) => {
                            if let SessionStatus::Close(reason) = self.handle_event(event).await {
                                let _ = self.outbound.send(Outbound::Close(reason));
                                break;
                            }
                        }
                        None => break, // transport went away
                    }
                }
                event = groups.recv() => {
                    if let Some(event) = event {
                        self.on_group_event(event);
                    }
                }
            }
        }

        self.disconnect().await;
    }

    fn user_id(&self) -> Option<Uuid> {
        match self.auth {
            SessionAuth::Authenticated { user_id } => Some(user_id),
            SessionAuth::Unauthenticated => None,
        }
    }

    fn send_event(&self, event: ServerEvent) {
        let _ = self.outbound.send(Outbound::Event(event));
    }

    fn send_error(&self, code: ErrorCode, error: impl Into<String>) {
        self.send_event(ServerEvent::Error {
            code,
            error: error.into(),
        });
    }

    /// Report a handler failure as a typed, non-fatal error event. Internal
    /// detail stays in the logs; the client sees a generic message.
    fn send_app_error(&self, err: AppError) {
        let (code, message) = match &err {
            AppError::Validation(message) => (ErrorCode::ValidationError, message.clone()),
            AppError::Forbidden => (
                ErrorCode::Forbidden,
                "Not authorized for this conversation".to_string(),
            ),
            AppError::NotFound => (ErrorCode::NotFound, "Message not found".to_string()),
            AppError::Unauthorized => (ErrorCode::AuthFailed, "Invalid or expired token".to_string()),
            _ => {
                tracing::error!(error = %err, "internal error while handling event");
                (ErrorCode::InternalError, "Internal server error".to_string())
            }
        };
        self.send_error(code, message);
    }

    async fn handle_event(&mut self, event: ClientEvent) -> SessionStatus {
        match event {
            ClientEvent::Authenticate { token } => self.authenticate(&token).await,
            other => {
                let Some(user_id) = self.user_id() else {
                    self.send_error(
                        ErrorCode::AuthRequired,
                        "Authentication required. Please send an authenticate event first.",
                    );
                    return SessionStatus::Continue;
                };
                self.dispatch_authenticated(user_id, other).await;
                SessionStatus::Continue
            }
        }
    }

    async fn dispatch_authenticated(&mut self, user_id: Uuid, event: ClientEvent) {
        let result = match event {
            ClientEvent::Authenticate { .. } => return, // handled by the caller
            ClientEvent::SendMessage {
                conversation_id,
                recipient_id,
                text,
                attachments,
            } => {
                self.handle_send_message(user_id, conversation_id, recipient_id, text, attachments)
                    .await
            }
            ClientEvent::Typing {
                conversation_id,
                is_typing,
            } => self.handle_typing(user_id, conversation_id, is_typing).await,
            ClientEvent::ReadReceipt {
                conversation_id,
                message_ids,
            } => {
                self.handle_read_receipt(user_id, conversation_id, message_ids)
                    .await
            }
            ClientEvent::Reconnect {} => {
                if let Err(err) = self.reconcile(user_id).await {
                    tracing::error!(error = %err, user_id = %user_id, "reconnect failed");
                    self.send_error(ErrorCode::ReconnectFailed, "Failed to reconnect");
                }
                Ok(())
            }
            ClientEvent::GetMissedMessages { conversation_id } => {
                self.handle_get_missed_messages(user_id, conversation_id).await
            }
            ClientEvent::NotificationsSync { unread_only, limit } => {
                self.handle_notifications_sync(user_id, unread_only, limit).await
            }
            ClientEvent::EditMessage { message_id, text } => {
                self.handle_edit_message(user_id, message_id, text).await
            }
            ClientEvent::DeleteMessage { message_id } => {
                self.handle_delete_message(user_id, message_id).await
            }
            ClientEvent::Ping {} => {
                self.send_event(ServerEvent::Pong);
                Ok(())
            }
        };

        if let Err(err) = result {
            self.send_app_error(err);
        }
    }

    /// Verify the token, join groups, replay missed state, confirm. Fatal on
    /// verification or connect-target authorization failure; the socket is
    /// closed with a distinguishing code.
    async fn authenticate(&mut self, token: &str) -> SessionStatus {
        let user_id = match self.state.verifier.verify(token).await {
            Ok(user_id) => user_id,
            Err(err) => {
                tracing::warn!(error = %err, "websocket authentication failed");
                self.send_error(ErrorCode::AuthFailed, "Invalid or expired token");
                return SessionStatus::Close(CloseReason::Unauthorized);
            }
        };

        self.auth = SessionAuth::Authenticated { user_id };

        if let Err(err) = self.state.messages.touch_last_seen(user_id).await {
            tracing::warn!(error = %err, user_id = %user_id, "failed to refresh last seen");
        }

        if let ConnectionTarget::Conversation(conversation_id) = self.target {
            // Fail closed: lookup problems count as "not a member"
            let authorized = match self.state.messages.conversation(conversation_id).await {
                Ok(Some(conversation)) => conversation.is_participant(user_id),
                Ok(None) => false,
                Err(err) => {
                    tracing::error!(error = %err, conversation_id = %conversation_id, "membership check failed");
                    false
                }
            };
            if !authorized {
                self.send_error(
                    ErrorCode::Forbidden,
                    format!("Not authorized for conversation {conversation_id}"),
                );
                return SessionStatus::Close(CloseReason::Forbidden);
            }
            self.join(Group::Conversation(conversation_id)).await;
            self.broadcast_presence(user_id, PresenceStatus::Online).await;
        }

        self.join(Group::User(user_id)).await;

        if let Err(err) = self.reconcile(user_id).await {
            tracing::error!(error = %err, user_id = %user_id, "reconciliation failed during authenticate");
        }

        match self
            .state
            .notifications
            .list(user_id, true, self.state.config.notifications_limit)
            .await
        {
            Ok(notifications) if !notifications.is_empty() => {
                self.send_event(ServerEvent::NotificationsSync { notifications });
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(error = %err, user_id = %user_id, "failed to fetch unread notifications");
            }
        }

        self.send_event(ServerEvent::Authenticated {
            user_id,
            conversation_id: self.target.conversation(),
        });
        tracing::info!(user_id = %user_id, "session authenticated");
        SessionStatus::Continue
    }

    /// Join every conversation group the user belongs to and replay messages
    /// strictly newer than the per-conversation marker: the session's own
    /// value, else the conversation's last-message timestamp, else the user's
    /// stored last-seen. Replay is deduplicated by message id, oldest first.
    async fn reconcile(&mut self, user_id: Uuid) -> AppResult<()> {
        let conversations = self.state.messages.conversations_for(user_id).await?;
        let fallback = self.state.messages.last_seen(user_id).await?;

        for conversation in conversations {
            let group = Group::Conversation(conversation.id);
            if !self.joined.contains(&group) {
                self.join(group).await;
            }

            let marker = self
                .last_seen
                .get(&conversation.id)
                .copied()
                .or(conversation.last_message_at)
                .or(fallback);

            if let Some(after) = marker {
                let missed = self
                    .state
                    .messages
                    .messages_after(conversation.id, after, self.state.config.missed_limit)
                    .await?;
                for message in missed {
                    if self.delivered.insert(message.id) {
                        self.send_event(ServerEvent::MissedMessage {
                            conversation_id: conversation.id,
                            message: MessagePayload::from(&message),
                        });
                    }
                }
            }

            if let Some(at) = conversation.last_message_at {
                self.last_seen.insert(conversation.id, at);
            }
        }
        Ok(())
    }

    async fn handle_send_message(
        &mut self,
        user_id: Uuid,
        conversation_id: Option<Uuid>,
        recipient_id: Option<Uuid>,
        text: String,
        attachments: Option<Vec<String>>,
    ) -> AppResult<()> {
        let target = conversation_id.or(self.target.conversation());
        if target.is_none() && recipient_id.is_none() {
            return Err(AppError::Validation("conversation_id is required".into()));
        }

        if text.trim().is_empty() {
            return Err(AppError::Validation("Message text cannot be empty".into()));
        }

        if let Some(conversation_id) = target {
            let authorized = self
                .state
                .messages
                .conversation(conversation_id)
                .await?
                .map(|c| c.is_participant(user_id))
                .unwrap_or(false);
            if !authorized {
                return Err(AppError::Forbidden);
            }
        }

        let attachments = attachments.unwrap_or_default();
        let message = self
            .state
            .messages
            .create_message(target, user_id, recipient_id, &text, &attachments)
            .await?;
        let conversation = self
            .state
            .messages
            .conversation(message.conversation_id)
            .await?
            .ok_or(AppError::Internal)?;

        // Notify the peer; a failure here leaves the message fully sent
        let sender_name = match self.state.profiles.display_name(user_id).await {
            Ok(Some(name)) => name,
            Ok(None) => "Someone".to_string(),
            Err(err) => {
                tracing::warn!(error = %err, user_id = %user_id, "display name lookup failed");
                "Someone".to_string()
            }
        };
        let preview = preview_of(&message.text);
        for peer in conversation.participants() {
            if peer == user_id {
                continue;
            }
            if let Err(err) = self
                .state
                .notifications
                .send(
                    peer,
                    NotificationKind::NewMessage,
                    &format!("New message from {sender_name}"),
                    &preview,
                    Some(message.conversation_id),
                )
                .await
            {
                tracing::error!(error = %err, user_id = %peer, "failed to create message notification");
            }
        }

        if let Err(err) = self.state.messages.touch_last_seen(user_id).await {
            tracing::warn!(error = %err, user_id = %user_id, "failed to refresh last seen");
        }

        let payload = MessagePayload::from(&message);
        self.delivered.insert(message.id);
        self.last_seen
            .insert(message.conversation_id, message.created_at);

        self.state
            .registry
            .send(
                Group::Conversation(message.conversation_id),
                &GroupEvent::MessageNew {
                    message: payload.clone(),
                },
            )
            .await;
        self.send_event(ServerEvent::MessageSent { message: payload });
        Ok(())
    }

    /// Ephemeral: nothing is persisted, peers just see the indicator.
    async fn handle_typing(
        &mut self,
        user_id: Uuid,
        conversation_id: Option<Uuid>,
        is_typing: bool,
    ) -> AppResult<()> {
        let conversation_id = conversation_id
            .or(self.target.conversation())
            .ok_or_else(|| AppError::Validation("conversation_id is required".into()))?;

        self.state
            .registry
            .send(
                Group::Conversation(conversation_id),
                &GroupEvent::Typing { user_id, is_typing },
            )
            .await;
        Ok(())
    }

    async fn handle_read_receipt(
        &mut self,
        user_id: Uuid,
        conversation_id: Option<Uuid>,
        message_ids: Option<Vec<Uuid>>,
    ) -> AppResult<()> {
        let conversation_id = conversation_id
            .or(self.target.conversation())
            .ok_or_else(|| AppError::Validation("conversation_id is required".into()))?;

        let count = match message_ids.filter(|ids| !ids.is_empty()) {
            Some(ids) => {
                let mut count = 0u64;
                for id in ids {
                    match self.state.messages.mark_message_read(id).await {
                        Ok(()) => count += 1,
                        Err(err) => {
                            tracing::warn!(error = %err, message_id = %id, "failed to mark message read");
                        }
                    }
                }
                self.state
                    .messages
                    .reset_unread(conversation_id, user_id)
                    .await?;
                count
            }
            None => {
                self.state
                    .messages
                    .mark_conversation_read(conversation_id, user_id)
                    .await?
            }
        };

        self.state
            .registry
            .send(
                Group::Conversation(conversation_id),
                &GroupEvent::ReadReceipt {
                    user_id,
                    conversation_id,
                    message_count: count,
                },
            )
            .await;
        Ok(())
    }

    async fn handle_get_missed_messages(
        &mut self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> AppResult<()> {
        let conversation = self
            .state
            .messages
            .conversation(conversation_id)
            .await?
            .filter(|c| c.is_participant(user_id))
            .ok_or(AppError::Forbidden)?;

        let marker = self
            .last_seen
            .get(&conversation_id)
            .copied()
            .or(conversation.last_message_at);

        let messages = match marker {
            Some(after) => {
                self.state
                    .messages
                    .messages_after(conversation_id, after, self.state.config.missed_limit)
                    .await?
            }
            None => Vec::new(),
        };

        self.send_event(ServerEvent::MissedMessages {
            conversation_id,
            messages: messages.iter().map(MessagePayload::from).collect(),
        });
        Ok(())
    }

    /// Re-fetch and re-emit notifications without touching read state.
    async fn handle_notifications_sync(
        &mut self,
        user_id: Uuid,
        unread_only: bool,
        limit: Option<i64>,
    ) -> AppResult<()> {
        let limit = limit
            .unwrap_or(self.state.config.notifications_limit)
            .min(self.state.config.notifications_limit);
        let notifications = self
            .state
            .notifications
            .list(user_id, unread_only, limit)
            .await?;
        self.send_event(ServerEvent::NotificationsSync { notifications });
        Ok(())
    }

    async fn handle_edit_message(
        &mut self,
        user_id: Uuid,
        message_id: Uuid,
        text: String,
    ) -> AppResult<()> {
        if text.trim().is_empty() {
            return Err(AppError::Validation(
                "text is required and cannot be empty".into(),
            ));
        }

        let message = self
            .state
            .messages
            .message(message_id)
            .await?
            .ok_or(AppError::NotFound)?;
        let conversation = self
            .state
            .messages
            .conversation(message.conversation_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if !conversation.is_participant(user_id) {
            return Err(AppError::Forbidden);
        }

        // The store enforces that only the original sender may edit
        let updated = self
            .state
            .messages
            .update_message(message_id, user_id, &text)
            .await?;

        self.state
            .registry
            .send(
                Group::Conversation(updated.conversation_id),
                &GroupEvent::MessageEdited {
                    message: MessagePayload::from(&updated),
                },
            )
            .await;
        Ok(())
    }

    async fn handle_delete_message(&mut self, user_id: Uuid, message_id: Uuid) -> AppResult<()> {
        let message = self
            .state
            .messages
            .message(message_id)
            .await?
            .ok_or(AppError::NotFound)?;
        let conversation = self
            .state
            .messages
            .conversation(message.conversation_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if !conversation.is_participant(user_id) {
            return Err(AppError::Forbidden);
        }

        // Soft delete at the store; the tombstoned row comes back for fan-out
        let deleted = self
            .state
            .messages
            .delete_message(message_id, user_id)
            .await?;

        self.state
            .registry
            .send(
                Group::Conversation(deleted.conversation_id),
                &GroupEvent::MessageDeleted {
                    message: MessagePayload::from(&deleted),
                },
            )
            .await;
        Ok(())
    }

    /// Forward a group event to this connection's transport.
    ///
    /// New messages are deduplicated by id; typing, read-receipt and presence
    /// events from this session's own user are dropped (no self-echo); edit,
    /// delete and notification events pass through unconditionally.
    fn on_group_event(&mut self, event: GroupEvent) {
        let own = self.user_id();
        match event {
            GroupEvent::MessageNew { message } => {
                if self.delivered.insert(message.id) {
                    self.last_seen
                        .insert(message.conversation_id, message.timestamp);
                    self.send_event(ServerEvent::Message { message });
                }
            }
            GroupEvent::MessageEdited { message } => {
                self.send_event(ServerEvent::MessageEdited { message });
            }
            GroupEvent::MessageDeleted { message } => {
                self.send_event(ServerEvent::MessageDeleted { message });
            }
            GroupEvent::Typing { user_id, is_typing } => {
                if own != Some(user_id) {
                    self.send_event(ServerEvent::Typing { user_id, is_typing });
                }
            }
            GroupEvent::ReadReceipt {
                user_id,
                conversation_id,
                message_count,
            } => {
                if own != Some(user_id) {
                    self.send_event(ServerEvent::ReadReceipt {
                        user_id,
                        conversation_id,
                        message_count,
                    });
                }
            }
            GroupEvent::Presence { user_id, status } => {
                if own != Some(user_id) {
                    self.send_event(ServerEvent::Presence { user_id, status });
                }
            }
            GroupEvent::Notification { notification } => {
                self.send_event(ServerEvent::Notification { notification });
            }
        }
    }

    async fn join(&mut self, group: Group) {
        if self.joined.insert(group) {
            self.state
                .registry
                .join(group, self.id, self.group_tx.clone())
                .await;
        }
    }

    async fn broadcast_presence(&self, user_id: Uuid, status: PresenceStatus) {
        for group in &self.joined {
            self.state
                .registry
                .send(*group, &GroupEvent::Presence { user_id, status })
                .await;
        }
    }

    /// Tear the session down: announce offline, leave every group, drop all
    /// session-local state. Nothing is persisted.
    async fn disconnect(&mut self) {
        if let Some(user_id) = self.user_id() {
            self.broadcast_presence(user_id, PresenceStatus::Offline).await;
            tracing::info!(user_id = %user_id, "session disconnected");
        }
        for group in std::mem::take(&mut self.joined) {
            self.state.registry.leave(group, self.id).await;
        }
        self.delivered.clear();
        self.last_seen.clear();
    }
}

/// Notification body preview: the first 100 characters of the message.
fn preview_of(text: &str) -> String {
    const MAX: usize = 100;
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(MAX).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
