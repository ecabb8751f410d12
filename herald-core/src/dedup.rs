//! Durable record of fingerprints that have already been published.
//!
//! `insert_if_absent` is a single conditional `INSERT`, so concurrent or
//! overlapping callers (two scheduler ticks, a tick and a backfill) can never
//! both see the same fingerprint as new.
//!
//! Uploads that fail after publishing are queued in `pending_ingest`, kept
//! apart from the seen records so a retry never re-publishes.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;
use std::collections::HashSet;

use crate::models::{ContentKind, PendingIngest, SeenRecord};

#[derive(Debug, Clone)]
pub struct DedupStore {
    pool: SqlitePool,
}

impl DedupStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns `true` only for the caller that actually created the record.
    pub async fn insert_if_absent(
        &self,
        fingerprint: &str,
        kind: ContentKind,
    ) -> Result<bool, sqlx::Error> {
        self.insert_if_absent_at(fingerprint, kind, Utc::now()).await
    }

    pub async fn insert_if_absent_at(
        &self,
        fingerprint: &str,
        kind: ContentKind,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO seen_content (fingerprint, kind, first_seen_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(fingerprint) DO NOTHING",
        )
        .bind(fingerprint)
        .bind(kind.as_str())
        .bind(seen_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Bulk insert-if-absent; returns how many were new.
    pub async fn seed<'a, I>(&self, entries: I) -> Result<u64, sqlx::Error>
    where
        I: IntoIterator<Item = (&'a str, ContentKind)>,
    {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for (fingerprint, kind) in entries {
            let result = sqlx::query(
                "INSERT INTO seen_content (fingerprint, kind, first_seen_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(fingerprint) DO NOTHING",
            )
            .bind(fingerprint)
            .bind(kind.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Delete records first seen more than `max_age` ago. Records younger than
    /// `max_age` are never touched.
    pub async fn prune(&self, max_age: chrono::Duration) -> Result<u64, sqlx::Error> {
        let cutoff = (Utc::now() - max_age).timestamp_millis();
        let result = sqlx::query("DELETE FROM seen_content WHERE first_seen_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            tracing::info!(pruned, "Pruned expired seen-content records");
        }

        let abandoned = sqlx::query("DELETE FROM pending_ingest WHERE queued_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if abandoned > 0 {
            tracing::warn!(abandoned, "Gave up on expired pending ingests");
        }
        Ok(pruned)
    }

    /// Queue a failed upload for a later tick. Re-queuing keeps the original
    /// entry.
    pub async fn defer_ingest(
        &self,
        fingerprint: &str,
        kind: ContentKind,
        link: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO pending_ingest (fingerprint, kind, link, queued_at, attempts)
             VALUES (?1, ?2, ?3, ?4, 0)
             ON CONFLICT(fingerprint) DO NOTHING",
        )
        .bind(fingerprint)
        .bind(kind.as_str())
        .bind(link)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Oldest queued uploads of one kind first.
    pub async fn pending_ingests(
        &self,
        kind: ContentKind,
        limit: u32,
    ) -> Result<Vec<PendingIngest>, sqlx::Error> {
        let rows: Vec<(String, String, String, i64, i64)> = sqlx::query_as(
            "SELECT fingerprint, kind, link, queued_at, attempts FROM pending_ingest
             WHERE kind = ?1
             ORDER BY queued_at, fingerprint
             LIMIT ?2",
        )
        .bind(kind.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(into_pending).collect()
    }

    /// Returns whether an entry was removed.
    pub async fn clear_pending_ingest(&self, fingerprint: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM pending_ingest WHERE fingerprint = ?1")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn record_ingest_failure(&self, fingerprint: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE pending_ingest SET attempts = attempts + 1 WHERE fingerprint = ?1")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn pending_ingest_count(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_ingest")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn contains(&self, fingerprint: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM seen_content WHERE fingerprint = ?1")
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<SeenRecord>, sqlx::Error> {
        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT fingerprint, kind, first_seen_at FROM seen_content WHERE fingerprint = ?1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.map(into_record).transpose()
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM seen_content")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn count_kind(&self, kind: ContentKind) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM seen_content WHERE kind = ?1")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Every stored fingerprint of one kind.
    pub async fn fingerprints(&self, kind: ContentKind) -> Result<HashSet<String>, sqlx::Error> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT fingerprint FROM seen_content WHERE kind = ?1")
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(fp,)| fp).collect())
    }
}

fn into_record((fingerprint, kind, first_seen_at): (String, String, i64)) -> Result<SeenRecord, sqlx::Error> {
    let kind = kind
        .parse::<ContentKind>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;
    let first_seen_at = Utc
        .timestamp_millis_opt(first_seen_at)
        .single()
        .ok_or_else(|| sqlx::Error::Decode(format!("bad timestamp {}", first_seen_at).into()))?;
    Ok(SeenRecord {
        fingerprint,
        kind,
        first_seen_at,
    })
}

fn into_pending(
    (fingerprint, kind, link, queued_at, attempts): (String, String, String, i64, i64),
) -> Result<PendingIngest, sqlx::Error> {
    let seen = into_record((fingerprint, kind, queued_at))?;
    Ok(PendingIngest {
        fingerprint: seen.fingerprint,
        kind: seen.kind,
        link,
        queued_at: seen.first_seen_at,
        attempts: attempts.max(0) as u32,
    })
}
