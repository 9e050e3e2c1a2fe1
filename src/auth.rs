use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Postgres, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // subject - the user_id
    pub exp: i64,    // expiration time (unix timestamp)
}

/// Opaque bearer token -> authenticated user id. Fails closed: any
/// verification problem surfaces as `Unauthorized`.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> AppResult<Uuid>;
}

/// HS256 JWT validation; the `sub` claim carries the user UUID.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> AppResult<Uuid> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| AppError::Unauthorized)?;
        Uuid::parse_str(&data.claims.sub).map_err(|_| AppError::Unauthorized)
    }
}

/// Fixed token -> user mapping for tests and local development.
#[derive(Default, Clone)]
pub struct StaticTokenVerifier {
    tokens: Arc<RwLock<HashMap<String, Uuid>>>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: impl Into<String>, user: Uuid) {
        self.tokens.write().await.insert(token.into(), user);
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> AppResult<Uuid> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        self.tokens
            .read()
            .await
            .get(token)
            .copied()
            .ok_or(AppError::Unauthorized)
    }
}

/// Display-name resolution, consumed when composing notification text.
/// Profile CRUD lives elsewhere; this is a read-only view of it.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn display_name(&self, user: Uuid) -> AppResult<Option<String>>;
}

pub struct PgProfileLookup {
    pool: Pool<Postgres>,
}

impl PgProfileLookup {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileLookup for PgProfileLookup {
    async fn display_name(&self, user: Uuid) -> AppResult<Option<String>> {
        let row = sqlx::query("SELECT display_name FROM user_profiles WHERE user_id = $1")
            .bind(user)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("display_name")))
    }
}

/// Fixed user -> name mapping for tests and local development.
#[derive(Default, Clone)]
pub struct StaticProfiles {
    names: Arc<RwLock<HashMap<Uuid, String>>>,
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: Uuid, name: impl Into<String>) {
        self.names.write().await.insert(user, name.into());
    }
}

#[async_trait]
impl ProfileLookup for StaticProfiles {
    async fn display_name(&self, user: Uuid) -> AppResult<Option<String>> {
        Ok(self.names.read().await.get(&user).cloned())
    }
}
