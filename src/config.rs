use dotenvy::dotenv;
use std::env;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub jwt_secret: String,
    /// Maximum missed messages replayed per conversation during reconciliation.
    pub missed_limit: i64,
    /// Maximum notifications replayed on authenticate / notifications_sync.
    pub notifications_limit: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000);
        let jwt_secret =
            env::var("JWT_SECRET").map_err(|_| AppError::Config("JWT_SECRET missing".into()))?;
        let missed_limit = env::var("WS_MISSED_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50);
        let notifications_limit = env::var("WS_NOTIFICATIONS_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50);

        Ok(Self {
            database_url,
            port,
            jwt_secret,
            missed_limit,
            notifications_limit,
        })
    }

    pub fn test_defaults() -> Self {
        Self {
            database_url: "postgres://localhost/test".into(),
            port: 3000,
            jwt_secret: "test-secret".into(),
            missed_limit: 50,
            notifications_limit: 50,
        }
    }
}
