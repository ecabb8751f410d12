//! Durable user -> upstream session mapping.
//!
//! Sessions are only replaced on an explicit reset or when the caller hands
//! back a fresh session from a fallback reply. The service client itself never
//! touches this table.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;

use crate::client::{ClientError, ServiceClient};
use crate::models::{Session, SessionInfo};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Upstream error: {0}")]
    Upstream(#[from] ClientError),
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    pool: SqlitePool,
}

impl SessionRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stored session for `user_id`, creating one upstream on first contact.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        client: &ServiceClient,
    ) -> Result<Session, SessionError> {
        if let Some(session) = self.touch(user_id).await? {
            return Ok(session);
        }

        let created = client.create_session().await?;
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO chat_sessions (user_id, session_id, created_at, last_used_at, message_count)
             VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(&created.id)
        .bind(created.created_at.timestamp_millis())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            tracing::info!(user_id, session = %created.id, "Created chat session");
            return Ok(created);
        }

        // Lost a race with a concurrent first message; use the stored winner.
        match self.touch(user_id).await? {
            Some(session) => Ok(session),
            None => Ok(created),
        }
    }

    /// Record a fresh session returned by a fallback reply.
    pub async fn replace(&self, user_id: &str, session: &Session) -> Result<(), sqlx::Error> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO chat_sessions (user_id, session_id, created_at, last_used_at, message_count)
             VALUES (?1, ?2, ?3, ?4, 0)
             ON CONFLICT(user_id) DO UPDATE SET
                session_id = excluded.session_id,
                created_at = excluded.created_at,
                last_used_at = excluded.last_used_at",
        )
        .bind(user_id)
        .bind(&session.id)
        .bind(session.created_at.timestamp_millis())
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id, session = %session.id, "Replaced chat session");
        Ok(())
    }

    /// Explicit logical reset: forget the stored session and start a new one.
    pub async fn reset(&self, user_id: &str, client: &ServiceClient) -> Result<Session, SessionError> {
        sqlx::query("DELETE FROM chat_sessions WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        let session = client.create_session().await?;
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO chat_sessions (user_id, session_id, created_at, last_used_at, message_count)
             VALUES (?1, ?2, ?3, ?4, 0)
             ON CONFLICT(user_id) DO UPDATE SET
                session_id = excluded.session_id,
                created_at = excluded.created_at,
                last_used_at = excluded.last_used_at,
                message_count = 0",
        )
        .bind(user_id)
        .bind(&session.id)
        .bind(session.created_at.timestamp_millis())
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id, session = %session.id, "Reset chat session");
        Ok(session)
    }

    pub async fn info(&self, user_id: &str) -> Result<Option<SessionInfo>, sqlx::Error> {
        let row: Option<(String, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT user_id, session_id, created_at, last_used_at, message_count
             FROM chat_sessions WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(user_id, session_id, created_at, last_used_at, message_count)| SessionInfo {
                user_id,
                session: Session {
                    id: session_id,
                    created_at: from_millis(created_at),
                },
                last_used_at: from_millis(last_used_at),
                message_count,
            },
        ))
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chat_sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Drop mappings idle for longer than `max_age`.
    pub async fn cleanup_older_than(&self, max_age: chrono::Duration) -> Result<u64, sqlx::Error> {
        let cutoff = (Utc::now() - max_age).timestamp_millis();
        let result = sqlx::query("DELETE FROM chat_sessions WHERE last_used_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Bump usage and return the stored session, if any.
    async fn touch(&self, user_id: &str) -> Result<Option<Session>, sqlx::Error> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "UPDATE chat_sessions
             SET last_used_at = ?2, message_count = message_count + 1
             WHERE user_id = ?1
             RETURNING session_id, created_at",
        )
        .bind(user_id)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, created_at)| Session {
            id,
            created_at: from_millis(created_at),
        }))
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
