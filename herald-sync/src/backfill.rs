//! Knowledge-base-only backfill: upload everything a producer yields without
//! publishing it. Goes through the same dedup gate as the scheduler, so it is
//! safe to run while ticks are in progress.

use anyhow::{Context, Result};
use herald_core::{DedupStore, ErrorClass, ServiceClient};
use serde::Serialize;
use std::time::Duration;

use crate::producer::ContentProducer;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub fetched: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Items are marked seen before upload. A failed upload stays seen, is
/// counted in `failed` and, unless rejected outright, queued for the
/// scheduler's next tick of that kind.
pub async fn run_backfill(
    producer: &dyn ContentProducer,
    store: &DedupStore,
    client: &ServiceClient,
    upload_spacing: Duration,
) -> Result<BackfillReport> {
    let items = producer
        .fetch()
        .await
        .with_context(|| format!("backfill fetch from {}", producer.name()))?;

    let mut report = BackfillReport {
        fetched: items.len(),
        ..Default::default()
    };
    tracing::info!(producer = producer.name(), items = items.len(), "Starting knowledge base backfill");

    for item in &items {
        let is_new = store
            .insert_if_absent(&item.fingerprint, item.kind)
            .await
            .context("dedup store during backfill")?;
        if !is_new {
            report.skipped += 1;
            continue;
        }

        if report.uploaded + report.failed > 0 && !upload_spacing.is_zero() {
            tokio::time::sleep(upload_spacing).await;
        }

        match client.upload_source(item.link()).await {
            Ok(_) => {
                report.uploaded += 1;
                tracing::debug!(fingerprint = %item.fingerprint, "Backfilled item");
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(fingerprint = %item.fingerprint, error = %e, "Backfill upload failed");
                if e.class() != ErrorClass::Fatal {
                    store
                        .defer_ingest(&item.fingerprint, item.kind, item.link())
                        .await
                        .context("queueing failed backfill upload")?;
                }
            }
        }
    }

    tracing::info!(
        producer = producer.name(),
        uploaded = report.uploaded,
        skipped = report.skipped,
        failed = report.failed,
        "Knowledge base backfill complete"
    );
    Ok(report)
}
