pub mod conversation;
pub mod message;
pub mod notification;

pub use conversation::Conversation;
pub use message::Message;
pub use notification::{Notification, NotificationKind};
