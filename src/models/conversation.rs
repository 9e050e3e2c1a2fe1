use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Two-party message thread. Participants are stored as a canonical ordered
/// pair (`user_a < user_b`) so lookups are independent of call order and the
/// pair maps to exactly one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_a: Uuid,
    pub user_b: Uuid,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Per-participant unread counter. A convenience signal for clients;
    /// missed-message recovery is derived from message timestamps instead.
    pub unread: HashMap<Uuid, i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn participants(&self) -> [Uuid; 2] {
        [self.user_a, self.user_b]
    }

    pub fn is_participant(&self, user: Uuid) -> bool {
        self.user_a == user || self.user_b == user
    }

    /// The other participant, when `user` is one of the pair.
    pub fn peer_of(&self, user: Uuid) -> Option<Uuid> {
        if user == self.user_a {
            Some(self.user_b)
        } else if user == self.user_b {
            Some(self.user_a)
        } else {
            None
        }
    }

    pub fn unread_for(&self, user: Uuid) -> i64 {
        self.unread.get(&user).copied().unwrap_or(0)
    }
}
