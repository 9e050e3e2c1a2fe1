//! End-to-end session scenarios: authentication, fan-out between live
//! sessions, reconnection replay and failure semantics, driven over the
//! session's channel interface with in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use messaging_gateway::auth::{StaticProfiles, StaticTokenVerifier};
use messaging_gateway::config::Config;
use messaging_gateway::models::message::DELETED_TEXT;
use messaging_gateway::models::NotificationKind;
use messaging_gateway::services::notification_service::NotificationService;
use messaging_gateway::state::AppState;
use messaging_gateway::storage::memory::{InMemoryMessageStore, InMemoryNotificationStore};
use messaging_gateway::storage::{MessageStore, NotificationStore};
use messaging_gateway::websocket::protocol::{
    ClientEvent, ErrorCode, PresenceStatus, ServerEvent,
};
use messaging_gateway::websocket::session::{ConnectionTarget, Outbound, SessionCore};
use messaging_gateway::websocket::GroupRegistry;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use uuid::Uuid;

struct Harness {
    state: AppState,
    verifier: StaticTokenVerifier,
    profiles: StaticProfiles,
    messages: InMemoryMessageStore,
    notifications: InMemoryNotificationStore,
}

fn harness() -> Harness {
    let registry = GroupRegistry::new();
    let messages = InMemoryMessageStore::new();
    let notifications = InMemoryNotificationStore::new();
    let verifier = StaticTokenVerifier::new();
    let profiles = StaticProfiles::new();

    let state = AppState {
        config: Arc::new(Config::test_defaults()),
        messages: Arc::new(messages.clone()),
        notifications: Arc::new(NotificationService::new(
            Arc::new(notifications.clone()),
            registry.clone(),
        )),
        registry,
        verifier: Arc::new(verifier.clone()),
        profiles: Arc::new(profiles.clone()),
    };

    Harness {
        state,
        verifier,
        profiles,
        messages,
        notifications,
    }
}

/// A connected client: a command sender into the session task and the
/// session's outbound frames.
struct Client {
    commands: UnboundedSender<ClientEvent>,
    outbound: UnboundedReceiver<Outbound>,
}

impl Client {
    fn connect(state: &AppState, target: ConnectionTarget, token: Option<&str>) -> Self {
        let (outbound_tx, outbound_rx) = unbounded_channel();
        let (command_tx, command_rx) = unbounded_channel();
        let session = SessionCore::new(state.clone(), target, outbound_tx);
        tokio::spawn(session.run(token.map(str::to_owned), command_rx));
        Self {
            commands: command_tx,
            outbound: outbound_rx,
        }
    }

    fn send(&self, event: ClientEvent) {
        self.commands.send(event).expect("session task gone");
    }

    async fn recv(&mut self) -> Outbound {
        timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("session closed its outbound channel")
    }

    async fn recv_event(&mut self) -> ServerEvent {
        match self.recv().await {
            Outbound::Event(event) => event,
            Outbound::Close(reason) => panic!("unexpected close: {reason:?}"),
        }
    }

    async fn expect_authenticated(&mut self) -> Uuid {
        match self.recv_event().await {
            ServerEvent::Authenticated { user_id, .. } => user_id,
            other => panic!("expected authenticated, got {other:?}"),
        }
    }

    /// Drop the connection, as a transport teardown would.
    fn disconnect(self) {}
}

async fn seeded_user(h: &Harness, token: &str) -> Uuid {
    let user = Uuid::new_v4();
    h.verifier.insert(token, user).await;
    user
}

#[tokio::test]
async fn connection_without_token_waits_for_authentication() {
    let h = harness();
    let mut client = Client::connect(&h.state, ConnectionTarget::NotificationsOnly, None);

    match client.recv_event().await {
        ServerEvent::AuthRequired { .. } => {}
        other => panic!("expected auth_required, got {other:?}"),
    }

    client.send(ClientEvent::Ping {});
    match client.recv_event().await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::AuthRequired),
        other => panic!("expected auth_required error, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_token_is_fatal_with_unauthorized_close_code() {
    let h = harness();
    let mut client =
        Client::connect(&h.state, ConnectionTarget::NotificationsOnly, Some("bogus"));

    match client.recv_event().await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::AuthFailed),
        other => panic!("expected auth_failed error, got {other:?}"),
    }
    match client.recv().await {
        Outbound::Close(reason) => assert_eq!(reason.code(), 4001),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn non_member_conversation_connect_is_fatal_with_forbidden_code() {
    let h = harness();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let conversation = h.messages.get_or_create_conversation(a, b).await.unwrap();
    let _outsider = seeded_user(&h, "outsider-token").await;

    let mut client = Client::connect(
        &h.state,
        ConnectionTarget::Conversation(conversation.id),
        Some("outsider-token"),
    );

    match client.recv_event().await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
        other => panic!("expected forbidden error, got {other:?}"),
    }
    match client.recv().await {
        Outbound::Close(reason) => assert_eq!(reason.code(), 4003),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn authenticate_replays_unread_notifications() {
    let h = harness();
    let user = seeded_user(&h, "t-user").await;

    let read = h
        .notifications
        .create(user, NotificationKind::PaymentSuccess, "Paid", "done", None)
        .await
        .unwrap();
    h.notifications.mark_read(read.id).await.unwrap();
    h.notifications
        .create(user, NotificationKind::SessionRequest, "Session", "requested", None)
        .await
        .unwrap();

    let mut client = Client::connect(&h.state, ConnectionTarget::NotificationsOnly, Some("t-user"));

    match client.recv_event().await {
        ServerEvent::NotificationsSync { notifications } => {
            assert_eq!(notifications.len(), 1);
            assert_eq!(notifications[0].kind, NotificationKind::SessionRequest);
        }
        other => panic!("expected notifications_sync, got {other:?}"),
    }
    assert_eq!(client.expect_authenticated().await, user);
}

#[tokio::test]
async fn first_message_creates_conversation_and_notifies_recipient() {
    let h = harness();
    let u1 = seeded_user(&h, "t-u1").await;
    let u2 = Uuid::new_v4();
    h.profiles.insert(u1, "Ada").await;

    let mut c1 = Client::connect(&h.state, ConnectionTarget::NotificationsOnly, Some("t-u1"));
    c1.expect_authenticated().await;

    c1.send(ClientEvent::SendMessage {
        conversation_id: None,
        recipient_id: Some(u2),
        text: "hi".into(),
        attachments: None,
    });

    let message = match c1.recv_event().await {
        ServerEvent::MessageSent { message } => message,
        other => panic!("expected message_sent, got {other:?}"),
    };
    assert_eq!(message.text, "hi");
    assert_eq!(message.sender_id, u1);

    let conversation = h
        .messages
        .conversation(message.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert!(conversation.is_participant(u1) && conversation.is_participant(u2));
    assert_eq!(conversation.last_message.as_deref(), Some("hi"));
    assert_eq!(conversation.unread_for(u2), 1);

    let pending = h.notifications.for_user(u2, true, 50).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, NotificationKind::NewMessage);
    assert_eq!(pending[0].title, "New message from Ada");
    assert_eq!(pending[0].body, "hi");
    assert_eq!(pending[0].related_id, Some(message.conversation_id));
}

#[tokio::test]
async fn live_fanout_between_two_sessions() {
    let h = harness();
    let u1 = seeded_user(&h, "t-u1").await;
    let u2 = seeded_user(&h, "t-u2").await;
    let conversation = h.messages.get_or_create_conversation(u1, u2).await.unwrap();

    let mut c1 = Client::connect(
        &h.state,
        ConnectionTarget::Conversation(conversation.id),
        Some("t-u1"),
    );
    c1.expect_authenticated().await;

    let mut c2 = Client::connect(
        &h.state,
        ConnectionTarget::Conversation(conversation.id),
        Some("t-u2"),
    );
    c2.expect_authenticated().await;

    // c1 sees the peer come online, not its own presence
    match c1.recv_event().await {
        ServerEvent::Presence { user_id, status } => {
            assert_eq!(user_id, u2);
            assert_eq!(status, PresenceStatus::Online);
        }
        other => panic!("expected presence, got {other:?}"),
    }

    c1.send(ClientEvent::SendMessage {
        conversation_id: None,
        recipient_id: None,
        text: "  hello there  ".into(),
        attachments: None,
    });

    // sender gets the confirmation only; the group copy is deduplicated
    let sent = match c1.recv_event().await {
        ServerEvent::MessageSent { message } => message,
        other => panic!("expected message_sent, got {other:?}"),
    };
    assert_eq!(sent.text, "hello there");

    // recipient gets the notification (personal group) then the message
    match c2.recv_event().await {
        ServerEvent::Notification { notification } => {
            assert_eq!(notification.kind, NotificationKind::NewMessage);
        }
        other => panic!("expected notification, got {other:?}"),
    }
    match c2.recv_event().await {
        ServerEvent::Message { message } => assert_eq!(message.id, sent.id),
        other => panic!("expected message, got {other:?}"),
    }

    // typing indicator reaches the peer but never echoes
    c1.send(ClientEvent::Typing {
        conversation_id: None,
        is_typing: true,
    });
    match c2.recv_event().await {
        ServerEvent::Typing { user_id, is_typing } => {
            assert_eq!(user_id, u1);
            assert!(is_typing);
        }
        other => panic!("expected typing, got {other:?}"),
    }
    c1.send(ClientEvent::Ping {});
    assert!(matches!(c1.recv_event().await, ServerEvent::Pong));

    // read receipt resets the unread counter and reaches the sender
    c2.send(ClientEvent::ReadReceipt {
        conversation_id: None,
        message_ids: None,
    });
    match c1.recv_event().await {
        ServerEvent::ReadReceipt {
            user_id,
            conversation_id,
            message_count,
        } => {
            assert_eq!(user_id, u2);
            assert_eq!(conversation_id, conversation.id);
            assert_eq!(message_count, 1);
        }
        other => panic!("expected read_receipt, got {other:?}"),
    }
    let stored = h
        .messages
        .conversation(conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.unread_for(u2), 0);

    // peer disconnect broadcasts offline presence
    c2.disconnect();
    match c1.recv_event().await {
        ServerEvent::Presence { user_id, status } => {
            assert_eq!(user_id, u2);
            assert_eq!(status, PresenceStatus::Offline);
        }
        other => panic!("expected presence, got {other:?}"),
    }
}

#[tokio::test]
async fn explicit_read_receipt_marks_exactly_those_messages() {
    let h = harness();
    let u1 = seeded_user(&h, "t-u1").await;
    let u2 = seeded_user(&h, "t-u2").await;
    let conversation = h.messages.get_or_create_conversation(u1, u2).await.unwrap();
    let m1 = h
        .messages
        .create_message(Some(conversation.id), u1, None, "one", &[])
        .await
        .unwrap();
    let m2 = h
        .messages
        .create_message(Some(conversation.id), u1, None, "two", &[])
        .await
        .unwrap();

    let mut c2 = Client::connect(
        &h.state,
        ConnectionTarget::Conversation(conversation.id),
        Some("t-u2"),
    );
    c2.expect_authenticated().await;

    c2.send(ClientEvent::ReadReceipt {
        conversation_id: None,
        message_ids: Some(vec![m1.id]),
    });
    // confirm processing completed before inspecting the store
    c2.send(ClientEvent::Ping {});
    assert!(matches!(c2.recv_event().await, ServerEvent::Pong));

    let first = h.messages.message(m1.id).await.unwrap().unwrap();
    assert!(first.is_read);
    assert!(first.read_at.is_some());
    let second = h.messages.message(m2.id).await.unwrap().unwrap();
    assert!(!second.is_read);

    let stored = h
        .messages
        .conversation(conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.unread_for(u2), 0);
}

#[tokio::test]
async fn edit_and_delete_propagate_to_the_group() {
    let h = harness();
    let u1 = seeded_user(&h, "t-u1").await;
    let u2 = seeded_user(&h, "t-u2").await;
    let conversation = h.messages.get_or_create_conversation(u1, u2).await.unwrap();

    let mut c1 = Client::connect(
        &h.state,
        ConnectionTarget::Conversation(conversation.id),
        Some("t-u1"),
    );
    c1.expect_authenticated().await;
    let mut c2 = Client::connect(
        &h.state,
        ConnectionTarget::Conversation(conversation.id),
        Some("t-u2"),
    );
    c2.expect_authenticated().await;
    assert!(matches!(
        c1.recv_event().await,
        ServerEvent::Presence { .. }
    ));

    c1.send(ClientEvent::SendMessage {
        conversation_id: None,
        recipient_id: None,
        text: "hi".into(),
        attachments: None,
    });
    let sent = match c1.recv_event().await {
        ServerEvent::MessageSent { message } => message,
        other => panic!("expected message_sent, got {other:?}"),
    };
    assert!(matches!(c2.recv_event().await, ServerEvent::Notification { .. }));
    assert!(matches!(c2.recv_event().await, ServerEvent::Message { .. }));

    // a non-sender cannot edit
    c2.send(ClientEvent::EditMessage {
        message_id: sent.id,
        text: "hijacked".into(),
    });
    match c2.recv_event().await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
        other => panic!("expected forbidden error, got {other:?}"),
    }
    assert_eq!(
        h.messages.message(sent.id).await.unwrap().unwrap().text,
        "hi"
    );

    // sender edit reaches both members
    c1.send(ClientEvent::EditMessage {
        message_id: sent.id,
        text: "hello".into(),
    });
    for client in [&mut c1, &mut c2] {
        match client.recv_event().await {
            ServerEvent::MessageEdited { message } => {
                assert_eq!(message.text, "hello");
                assert!(message.is_edited);
            }
            other => panic!("expected message_edited, got {other:?}"),
        }
    }
    let stored = h
        .messages
        .conversation(conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.last_message.as_deref(), Some("hello"));

    // sender delete tombstones and clears the conversation display
    c1.send(ClientEvent::DeleteMessage { message_id: sent.id });
    for client in [&mut c1, &mut c2] {
        match client.recv_event().await {
            ServerEvent::MessageDeleted { message } => {
                assert_eq!(message.text, DELETED_TEXT);
                assert!(message.is_deleted);
                assert!(message.attachments.is_empty());
            }
            other => panic!("expected message_deleted, got {other:?}"),
        }
    }
    let stored = h
        .messages
        .conversation(conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.last_message.is_none());
}

#[tokio::test]
async fn reconnect_replays_missed_messages_without_duplicates() {
    let h = harness();
    let u1 = seeded_user(&h, "t-u1").await;
    let u2 = seeded_user(&h, "t-u2").await;
    h.profiles.insert(u1, "Ada").await;

    // u2 authenticates before any of this traffic exists, which records its
    // last-seen marker
    let mut c2 = Client::connect(&h.state, ConnectionTarget::NotificationsOnly, Some("t-u2"));
    c2.expect_authenticated().await;

    // u1 then sends and deletes a message; u2's session is not yet in the
    // freshly created conversation group, and the delete clears the
    // conversation's last-message timestamp, so a later reconcile has to fall
    // back to u2's own last-seen marker and surfaces the tombstoned row
    let mut c1 = Client::connect(&h.state, ConnectionTarget::NotificationsOnly, Some("t-u1"));
    c1.expect_authenticated().await;
    c1.send(ClientEvent::SendMessage {
        conversation_id: None,
        recipient_id: Some(u2),
        text: "you missed this".into(),
        attachments: None,
    });
    let sent = match c1.recv_event().await {
        ServerEvent::MessageSent { message } => message,
        other => panic!("expected message_sent, got {other:?}"),
    };
    c1.send(ClientEvent::DeleteMessage { message_id: sent.id });
    c1.send(ClientEvent::Ping {});
    assert!(matches!(c1.recv_event().await, ServerEvent::Pong));

    // the new-message notification was delivered live over u2's user group
    match c2.recv_event().await {
        ServerEvent::Notification { notification } => {
            assert_eq!(notification.kind, NotificationKind::NewMessage);
            assert_eq!(notification.title, "New message from Ada");
        }
        other => panic!("expected notification, got {other:?}"),
    }

    // an explicit reconnect joins the new conversation group and replays the
    // missed (now tombstoned) message
    c2.send(ClientEvent::Reconnect {});
    match c2.recv_event().await {
        ServerEvent::MissedMessage {
            conversation_id,
            message,
        } => {
            assert_eq!(conversation_id, sent.conversation_id);
            assert_eq!(message.id, sent.id);
            assert_eq!(message.text, DELETED_TEXT);
            assert!(message.is_deleted);
        }
        other => panic!("expected missed_message, got {other:?}"),
    }

    // running reconciliation again must not deliver duplicates
    c2.send(ClientEvent::Reconnect {});
    c2.send(ClientEvent::Ping {});
    assert!(matches!(c2.recv_event().await, ServerEvent::Pong));
}

#[tokio::test]
async fn get_missed_messages_requires_membership() {
    let h = harness();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let conversation = h.messages.get_or_create_conversation(a, b).await.unwrap();
    let _outsider = seeded_user(&h, "t-outsider").await;

    let mut client = Client::connect(
        &h.state,
        ConnectionTarget::NotificationsOnly,
        Some("t-outsider"),
    );
    client.expect_authenticated().await;

    client.send(ClientEvent::GetMissedMessages {
        conversation_id: conversation.id,
    });
    match client.recv_event().await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
        other => panic!("expected forbidden error, got {other:?}"),
    }
}

#[tokio::test]
async fn notifications_sync_does_not_mutate_read_state() {
    let h = harness();
    let user = seeded_user(&h, "t-user").await;
    h.notifications
        .create(user, NotificationKind::SubscriptionUpdated, "Plan", "updated", None)
        .await
        .unwrap();

    let mut client = Client::connect(&h.state, ConnectionTarget::NotificationsOnly, Some("t-user"));
    assert!(matches!(
        client.recv_event().await,
        ServerEvent::NotificationsSync { .. }
    ));
    client.expect_authenticated().await;

    client.send(ClientEvent::NotificationsSync {
        unread_only: true,
        limit: None,
    });
    match client.recv_event().await {
        ServerEvent::NotificationsSync { notifications } => {
            assert_eq!(notifications.len(), 1);
            assert!(!notifications[0].is_read);
        }
        other => panic!("expected notifications_sync, got {other:?}"),
    }

    // still unread after two syncs
    assert_eq!(h.notifications.unread_count(user).await.unwrap(), 1);
}

#[tokio::test]
async fn validation_errors_keep_the_session_alive() {
    let h = harness();
    let user = seeded_user(&h, "t-user").await;

    let mut client = Client::connect(&h.state, ConnectionTarget::NotificationsOnly, Some("t-user"));
    assert_eq!(client.expect_authenticated().await, user);

    // whitespace-only text is rejected
    client.send(ClientEvent::SendMessage {
        conversation_id: None,
        recipient_id: Some(Uuid::new_v4()),
        text: "   ".into(),
        attachments: None,
    });
    match client.recv_event().await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::ValidationError),
        other => panic!("expected validation error, got {other:?}"),
    }

    // no target conversation at all
    client.send(ClientEvent::SendMessage {
        conversation_id: None,
        recipient_id: None,
        text: "hi".into(),
        attachments: None,
    });
    match client.recv_event().await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::ValidationError),
        other => panic!("expected validation error, got {other:?}"),
    }

    // editing a message that does not exist
    client.send(ClientEvent::EditMessage {
        message_id: Uuid::new_v4(),
        text: "hello".into(),
    });
    match client.recv_event().await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
        other => panic!("expected not_found error, got {other:?}"),
    }

    // the connection is still serviceable
    client.send(ClientEvent::Ping {});
    assert!(matches!(client.recv_event().await, ServerEvent::Pong));
}
