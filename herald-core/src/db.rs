use crate::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS seen_content (
        fingerprint   TEXT PRIMARY KEY,
        kind          TEXT NOT NULL,
        first_seen_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_seen_content_first_seen ON seen_content (first_seen_at)",
    "CREATE TABLE IF NOT EXISTS pending_ingest (
        fingerprint TEXT PRIMARY KEY,
        kind        TEXT NOT NULL,
        link        TEXT NOT NULL,
        queued_at   INTEGER NOT NULL,
        attempts    INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS chat_sessions (
        user_id       TEXT PRIMARY KEY,
        session_id    TEXT NOT NULL,
        created_at    INTEGER NOT NULL,
        last_used_at  INTEGER NOT NULL,
        message_count INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_chat_sessions_last_used ON chat_sessions (last_used_at)",
];

pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
}

/// Idempotent schema setup, safe to run on every start.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Pool + schema in one step.
pub async fn connect(config: &DatabaseConfig) -> Result<SqlitePool, sqlx::Error> {
    let pool = create_pool(config).await?;
    migrate(&pool).await?;
    Ok(pool)
}

pub async fn health_check(pool: &SqlitePool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT sqlite_version()")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// On-disk database in a temp dir. Keep the `TempDir` alive for the test.
    pub async fn temp_pool() -> (tempfile::TempDir, DatabaseConfig, SqlitePool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("herald.db").display()),
            max_connections: 5,
        };
        let pool = connect(&config).await.expect("connect");
        (dir, config, pool)
    }
}
