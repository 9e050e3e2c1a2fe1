use std::sync::Arc;

use crate::auth::{ProfileLookup, TokenVerifier};
use crate::config::Config;
use crate::services::notification_service::NotificationService;
use crate::storage::MessageStore;
use crate::websocket::GroupRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub messages: Arc<dyn MessageStore>,
    pub notifications: Arc<NotificationService>,
    pub registry: GroupRegistry,
    pub verifier: Arc<dyn TokenVerifier>,
    pub profiles: Arc<dyn ProfileLookup>,
}
