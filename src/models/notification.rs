use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of user-facing notification types. Producers across the
/// platform (messaging, payments, session booking) all go through this enum;
/// unknown type strings are rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewMessage,
    PaymentSuccess,
    PaymentReceived,
    SubscriptionUpdated,
    SessionRequest,
    SessionAccept,
    SessionReject,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::PaymentSuccess => "payment_success",
            Self::PaymentReceived => "payment_received",
            Self::SubscriptionUpdated => "subscription_updated",
            Self::SessionRequest => "session_request",
            Self::SessionAccept => "session_accept",
            Self::SessionReject => "session_reject",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new_message" => Some(Self::NewMessage),
            "payment_success" => Some(Self::PaymentSuccess),
            "payment_received" => Some(Self::PaymentReceived),
            "subscription_updated" => Some(Self::SubscriptionUpdated),
            "session_request" => Some(Self::SessionRequest),
            "session_accept" => Some(Self::SessionAccept),
            "session_reject" => Some(Self::SessionReject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub related_id: Option<Uuid>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
