//! Content sync scheduler.
//!
//! Each configured stream (articles, videos) runs its own loop:
//! `Idle -> Fetching -> Filtering -> Publishing -> Ingesting -> Idle`.
//! Streams never share a task, so a slow producer on one cannot delay the
//! other. Items are handled one at a time; shutdown is only observed between
//! items, so an item that passed the dedup gate is always published and
//! ingested before its loop exits (subject to the shutdown timeout).
//!
//! A failed knowledge base upload is queued in the store and retried at the
//! start of the stream's next tick, without publishing again.

use chrono::{DateTime, Utc};
use herald_core::config::{Band, SyncConfig};
use herald_core::models::{ContentItem, ContentKind, ContentPayload};
use herald_core::{DedupStore, ErrorClass, ServiceClient};
use rand::Rng;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::producer::ContentProducer;
use crate::publisher::PublishTarget;

/// Queued uploads retried per tick.
const PENDING_INGEST_BATCH: u32 = 25;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Filtering,
    Publishing,
    Ingesting,
    Stopped,
}

/// Uniform random delay band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalBand {
    pub min: Duration,
    pub max: Duration,
}

impl IntervalBand {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn fixed(d: Duration) -> Self {
        Self::new(d, d)
    }

    pub fn from_hours(band: Band) -> Self {
        Self::new(
            Duration::from_secs_f64(band.min.max(0.0) * 3600.0),
            Duration::from_secs_f64(band.max.max(0.0) * 3600.0),
        )
    }

    pub fn from_secs(band: Band) -> Self {
        Self::new(
            Duration::from_secs_f64(band.min.max(0.0)),
            Duration::from_secs_f64(band.max.max(0.0)),
        )
    }

    pub fn is_zero(&self) -> bool {
        self.max.is_zero()
    }

    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// Per-stream cursor. Only the stream's own loop writes it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleState {
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Outcome counts for one tick of one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub fetched: usize,
    pub already_seen: usize,
    /// Dedup store was unreachable; left for the next cycle.
    pub deferred: usize,
    pub published: usize,
    pub publish_failed: usize,
    pub ingested: usize,
    pub ingest_failed: usize,
    /// Queued uploads from earlier ticks tried again this tick.
    pub ingest_retried: usize,
    pub ingest_recovered: usize,
    pub pruned: u64,
    pub producer_failed: bool,
    /// Shutdown arrived mid-batch; remaining items were left unfiltered.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub name: String,
    pub kind: ContentKind,
    pub phase: SyncPhase,
    pub schedule: ScheduleState,
    pub last_report: Option<TickReport>,
    pub in_flight: Option<String>,
}

/// One polling stream: a producer and its interval band.
pub struct StreamSpec {
    pub name: String,
    pub producer: Arc<dyn ContentProducer>,
    pub interval: IntervalBand,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, producer: Arc<dyn ContentProducer>, interval: IntervalBand) -> Self {
        Self {
            name: name.into(),
            producer,
            interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub retention: chrono::Duration,
    pub run_on_start: bool,
    pub publish_spacing: IntervalBand,
    pub shutdown_timeout: Duration,
    pub summarize_articles: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            retention: config.retention(),
            run_on_start: config.run_on_start,
            publish_spacing: IntervalBand::from_secs(config.publish_spacing_secs),
            shutdown_timeout: config.shutdown_timeout(),
            summarize_articles: config.summarize_articles,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub pruned: u64,
    pub known: i64,
    /// Fingerprints seeded from the publish target's history on first run.
    pub seeded: u64,
}

// ============================================================================
// Stream worker
// ============================================================================

struct StreamWorker {
    spec: StreamSpec,
    kind: ContentKind,
    store: DedupStore,
    publisher: Arc<dyn PublishTarget>,
    client: Arc<ServiceClient>,
    settings: SyncSettings,
    status: RwLock<StreamStatus>,
}

impl StreamWorker {
    fn update(&self, f: impl FnOnce(&mut StreamStatus)) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.update(|s| s.phase = phase);
    }

    fn snapshot(&self) -> StreamStatus {
        self.status.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            stream = %self.spec.name,
            producer = self.spec.producer.name(),
            min_secs = self.spec.interval.min.as_secs(),
            max_secs = self.spec.interval.max.as_secs(),
            "Content stream started"
        );

        let mut delay = if self.settings.run_on_start {
            Duration::ZERO
        } else {
            self.spec.interval.sample()
        };

        loop {
            let next = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.update(|s| {
                s.phase = SyncPhase::Idle;
                s.schedule.next_run_at = Some(next);
            });

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let report = self.run_tick(&cancel).await;
            tracing::info!(
                stream = %self.spec.name,
                fetched = report.fetched,
                published = report.published,
                ingested = report.ingested,
                already_seen = report.already_seen,
                publish_failed = report.publish_failed,
                ingest_failed = report.ingest_failed,
                ingest_recovered = report.ingest_recovered,
                deferred = report.deferred,
                producer_failed = report.producer_failed,
                "Sync tick complete"
            );

            if cancel.is_cancelled() {
                break;
            }
            delay = self.spec.interval.sample();
        }

        self.update(|s| {
            s.phase = SyncPhase::Stopped;
            s.schedule.next_run_at = None;
        });
        tracing::info!(stream = %self.spec.name, "Content stream stopped");
    }

    async fn run_tick(&self, cancel: &CancellationToken) -> TickReport {
        let mut report = TickReport::default();
        self.update(|s| {
            s.phase = SyncPhase::Fetching;
            s.schedule.last_run_at = Some(Utc::now());
        });

        match self.store.prune(self.settings.retention).await {
            Ok(n) => report.pruned = n,
            Err(e) => tracing::warn!(stream = %self.spec.name, error = %e, "Prune failed"),
        }

        self.retry_pending_ingests(cancel, &mut report).await;
        if report.interrupted {
            return self.finish_tick(report);
        }
        self.set_phase(SyncPhase::Fetching);

        let items = match self.spec.producer.fetch().await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(
                    stream = %self.spec.name,
                    producer = self.spec.producer.name(),
                    error = %e,
                    "Producer failed, waiting for next interval"
                );
                report.producer_failed = true;
                return self.finish_tick(report);
            }
        };
        report.fetched = items.len();

        let mut remaining = items.len();
        for item in &items {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            remaining -= 1;

            let published = self.process_item(item, &mut report).await;

            if published && remaining > 0 && !self.settings.publish_spacing.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        report.interrupted = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.settings.publish_spacing.sample()) => {}
                }
            }
        }

        self.finish_tick(report)
    }

    fn finish_tick(&self, report: TickReport) -> TickReport {
        self.update(|s| {
            s.phase = SyncPhase::Idle;
            s.in_flight = None;
            s.last_report = Some(report.clone());
        });
        report
    }

    /// Upload what earlier ticks could not. Nothing here is published.
    async fn retry_pending_ingests(&self, cancel: &CancellationToken, report: &mut TickReport) {
        let stream = &self.spec.name;
        let pending = match self.store.pending_ingests(self.kind, PENDING_INGEST_BATCH).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(stream = %stream, error = %e, "Could not read pending ingests");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        self.set_phase(SyncPhase::Ingesting);
        for entry in &pending {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            report.ingest_retried += 1;
            self.update(|s| s.in_flight = Some(entry.fingerprint.clone()));

            let outcome = self.client.upload_source(&entry.link).await;
            let cleared = match &outcome {
                Ok(ack) => {
                    report.ingest_recovered += 1;
                    tracing::info!(
                        stream = %stream,
                        fingerprint = %entry.fingerprint,
                        ?ack,
                        attempts = entry.attempts + 1,
                        "Deferred ingest succeeded"
                    );
                    self.store.clear_pending_ingest(&entry.fingerprint).await.map(|_| ())
                }
                Err(e) if e.class() == ErrorClass::Fatal => {
                    tracing::warn!(
                        stream = %stream,
                        fingerprint = %entry.fingerprint,
                        error = %e,
                        "Deferred ingest rejected, dropping it"
                    );
                    self.store.clear_pending_ingest(&entry.fingerprint).await.map(|_| ())
                }
                Err(e) => {
                    tracing::warn!(
                        stream = %stream,
                        fingerprint = %entry.fingerprint,
                        error = %e,
                        "Deferred ingest failed again"
                    );
                    self.store.record_ingest_failure(&entry.fingerprint).await
                }
            };
            if let Err(e) = cleared {
                tracing::warn!(stream = %stream, fingerprint = %entry.fingerprint, error = %e, "Could not update pending ingest");
            }
        }
        self.update(|s| s.in_flight = None);
    }

    /// Best effort: any failure leaves the item without a summary.
    async fn summarize(&self, item: &ContentItem) -> Option<String> {
        if !self.settings.summarize_articles
            || item.kind != ContentKind::Article
            || item.payload.summary.is_some()
        {
            return None;
        }
        let body = item.payload.body.as_deref()?;
        match self.client.summarize(body).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(
                    stream = %self.spec.name,
                    fingerprint = %item.fingerprint,
                    error = %e,
                    "Summary unavailable, publishing without it"
                );
                None
            }
        }
    }

    /// Filter, publish and ingest one item. Returns whether it was published.
    async fn process_item(&self, item: &ContentItem, report: &mut TickReport) -> bool {
        let stream = &self.spec.name;
        self.set_phase(SyncPhase::Filtering);

        match self.store.insert_if_absent(&item.fingerprint, item.kind).await {
            Ok(true) => {}
            Ok(false) => {
                report.already_seen += 1;
                return false;
            }
            Err(e) => {
                tracing::warn!(
                    stream = %stream,
                    fingerprint = %item.fingerprint,
                    error = %e,
                    "Dedup store unavailable, item deferred to next cycle"
                );
                report.deferred += 1;
                return false;
            }
        }

        self.update(|s| {
            s.phase = SyncPhase::Publishing;
            s.in_flight = Some(item.fingerprint.clone());
        });

        let summarized;
        let item = match self.summarize(item).await {
            Some(summary) => {
                summarized = ContentItem {
                    payload: ContentPayload {
                        summary: Some(summary),
                        ..item.payload.clone()
                    },
                    ..item.clone()
                };
                &summarized
            }
            None => item,
        };

        match self.publisher.publish(item).await {
            Ok(published) => {
                report.published += 1;
                tracing::info!(
                    stream = %stream,
                    fingerprint = %item.fingerprint,
                    title = %item.payload.title,
                    message_id = ?published.message_id,
                    "Published item"
                );
            }
            Err(e) => {
                // Stays seen: an unpublishable item must not be retried every cycle.
                report.publish_failed += 1;
                tracing::warn!(
                    stream = %stream,
                    fingerprint = %item.fingerprint,
                    target = self.publisher.name(),
                    error = %e,
                    "Publish failed, item kept as seen"
                );
                self.update(|s| s.in_flight = None);
                return false;
            }
        }

        self.set_phase(SyncPhase::Ingesting);
        match self.client.upload_source(item.link()).await {
            Ok(ack) => {
                report.ingested += 1;
                tracing::debug!(stream = %stream, fingerprint = %item.fingerprint, ?ack, "Ingested item");
            }
            Err(e) => {
                report.ingest_failed += 1;
                if e.class() == ErrorClass::Fatal {
                    tracing::warn!(
                        stream = %stream,
                        fingerprint = %item.fingerprint,
                        error = %e,
                        "Knowledge base rejected item"
                    );
                } else {
                    tracing::warn!(
                        stream = %stream,
                        fingerprint = %item.fingerprint,
                        class = ?e.class(),
                        error = %e,
                        "Knowledge base ingest failed, queued for next tick"
                    );
                    if let Err(e) = self.store.defer_ingest(&item.fingerprint, item.kind, item.link()).await {
                        tracing::warn!(stream = %stream, fingerprint = %item.fingerprint, error = %e, "Could not queue ingest");
                    }
                }
            }
        }

        self.update(|s| s.in_flight = None);
        true
    }
}

// ============================================================================
// ContentSyncScheduler
// ============================================================================

pub struct ContentSyncScheduler {
    workers: Vec<Arc<StreamWorker>>,
    store: DedupStore,
    publisher: Arc<dyn PublishTarget>,
    client: Arc<ServiceClient>,
    settings: SyncSettings,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ContentSyncScheduler {
    pub fn new(
        store: DedupStore,
        publisher: Arc<dyn PublishTarget>,
        client: Arc<ServiceClient>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            workers: Vec::new(),
            store,
            publisher,
            client,
            settings,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn with_stream(mut self, spec: StreamSpec) -> Self {
        let kind = spec.producer.kind();
        let status = StreamStatus {
            name: spec.name.clone(),
            kind,
            phase: SyncPhase::Idle,
            schedule: ScheduleState::default(),
            last_report: None,
            in_flight: None,
        };
        self.workers.push(Arc::new(StreamWorker {
            spec,
            kind,
            store: self.store.clone(),
            publisher: self.publisher.clone(),
            client: self.client.clone(),
            settings: self.settings.clone(),
            status: RwLock::new(status),
        }));
        self
    }

    /// Prune expired records and, if the store is empty (first run), seed it
    /// from the publish target's recent history.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        match self.store.prune(self.settings.retention).await {
            Ok(n) => report.pruned = n,
            Err(e) => tracing::warn!(error = %e, "Startup prune failed"),
        }

        for worker in &self.workers {
            match self.store.count_kind(worker.kind).await {
                Ok(n) => {
                    tracing::info!(stream = %worker.spec.name, known = n, "Loaded seen fingerprints");
                    report.known += n;
                }
                Err(e) => tracing::warn!(stream = %worker.spec.name, error = %e, "Could not count seen fingerprints"),
            }
        }

        let total = match self.store.count().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Dedup store unavailable during reconciliation");
                return report;
            }
        };
        if total > 0 {
            return report;
        }

        match self.publisher.recent_fingerprints().await {
            Ok(found) => {
                let entries = found.iter().map(|(fp, kind)| (fp.as_str(), *kind));
                match self.store.seed(entries).await {
                    Ok(n) => {
                        report.seeded = n;
                        tracing::info!(seeded = n, target = self.publisher.name(), "Seeded dedup store from publish history");
                    }
                    Err(e) => tracing::warn!(error = %e, "Seeding dedup store failed"),
                }
            }
            Err(e) => tracing::info!(error = %e, "No publish history available, starting with an empty dedup store"),
        }

        report
    }

    /// Reconcile, then launch one loop per stream. Calling it again is a no-op.
    pub async fn start(&self) -> ReconcileReport {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() || self.cancel.is_cancelled() {
            tracing::warn!("Content sync scheduler already started");
            return ReconcileReport::default();
        }

        let report = self.reconcile().await;
        for worker in &self.workers {
            handles.push(tokio::spawn(worker.clone().run(self.cancel.child_token())));
        }
        tracing::info!(streams = self.workers.len(), "Content sync scheduler started");
        report
    }

    /// Signal every loop to finish its current item and exit. Waits up to the
    /// shutdown timeout; anything still running after that is aborted and its
    /// in-flight item logged. Returns `true` on a clean stop.
    pub async fn stop(&self) -> bool {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().await);
        if handles.is_empty() {
            return true;
        }

        let aborters: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let joined = tokio::time::timeout(
            self.settings.shutdown_timeout,
            futures::future::join_all(handles),
        )
        .await;

        if joined.is_ok() {
            tracing::info!("Content sync scheduler stopped");
            return true;
        }

        for worker in &self.workers {
            let status = worker.snapshot();
            if let Some(fp) = status.in_flight {
                tracing::warn!(
                    stream = %status.name,
                    fingerprint = %fp,
                    phase = ?status.phase,
                    "Shutdown timeout: abandoning in-flight item, it may not be ingested"
                );
            }
            worker.set_phase(SyncPhase::Stopped);
        }
        for aborter in aborters {
            aborter.abort();
        }
        tracing::warn!(
            timeout_secs = self.settings.shutdown_timeout.as_secs(),
            "Content sync scheduler forced to stop"
        );
        false
    }

    /// Run one tick of the named stream immediately.
    ///
    /// Public for testing and manual triggers.
    pub async fn run_tick(&self, stream: &str) -> Option<TickReport> {
        let worker = self.workers.iter().find(|w| w.spec.name == stream)?;
        Some(worker.run_tick(&self.cancel).await)
    }

    pub fn status(&self) -> Vec<StreamStatus> {
        self.workers.iter().map(|w| w.snapshot()).collect()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .workers
                .iter()
                .any(|w| w.snapshot().phase != SyncPhase::Stopped)
    }
}
