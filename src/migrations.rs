use sqlx::{Executor, Pool, Postgres};

// Embed SQL migrations at compile time for deterministic startup
const MIG_0001: &str = include_str!("../migrations/0001_create_conversations.sql");
const MIG_0002: &str = include_str!("../migrations/0002_create_messages.sql");
const MIG_0003: &str = include_str!("../migrations/0003_create_notifications.sql");
const MIG_0004: &str = include_str!("../migrations/0004_create_user_presence.sql");
const MIG_0005: &str = include_str!("../migrations/0005_create_user_profiles.sql");

pub async fn run_all(db: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    // Run sequentially; every statement is IF NOT EXISTS so reapplying is safe
    for (i, sql) in [MIG_0001, MIG_0002, MIG_0003, MIG_0004, MIG_0005]
        .into_iter()
        .enumerate()
    {
        let label = i + 1;
        // Plain execute keeps the simple query protocol, which allows the
        // multi-statement migration files.
        match db.execute(sql).await {
            Ok(_) => tracing::info!(migration = %label, "messaging-gateway migration applied"),
            Err(e) => {
                tracing::warn!(migration = %label, error = %e, "migration may have been applied already");
            }
        }
    }
    Ok(())
}
