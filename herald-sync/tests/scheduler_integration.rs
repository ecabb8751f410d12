//! Integration tests for the content sync scheduler
//!
//! These tests verify:
//! 1. An item seen on two consecutive ticks is published once
//! 2. A restart over a populated store publishes nothing already seen
//! 3. Publish and ingest failures stay isolated to their item; failed ingests
//!    are retried on the next tick without re-publishing
//! 4. A failing or hanging stream never holds up the other one
//! 5. Graceful stop finishes the in-flight item; the timeout forces a stop
//! 6. First-run seeding from publish history, and KB-only backfill
//! 7. Optional article summaries

use async_trait::async_trait;
use herald_core::config::DatabaseConfig;
use herald_core::models::{ContentItem, ContentKind, ContentPayload, Session};
use herald_core::{
    db, ClientError, DedupStore, IngestAck, ResponseStream, RetryPolicy, ServiceClient, Upstream,
};
use herald_sync::{
    run_backfill, ContentProducer, ContentSyncScheduler, IntervalBand, PublishError,
    PublishTarget, PublishedRef, StreamSpec, SyncPhase, SyncSettings,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Fakes
// ============================================================================

struct StaticProducer {
    kind: ContentKind,
    items: Vec<ContentItem>,
    fail: bool,
    delay: Duration,
    calls: AtomicUsize,
}

impl StaticProducer {
    fn new(kind: ContentKind, items: Vec<ContentItem>) -> Self {
        Self {
            kind,
            items,
            fail: false,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ContentProducer for StaticProducer {
    async fn fetch(&self) -> anyhow::Result<Vec<ContentItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            anyhow::bail!("feed unreachable");
        }
        Ok(self.items.clone())
    }

    fn kind(&self) -> ContentKind {
        self.kind
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<String>>,
    summaries: Mutex<Vec<Option<String>>>,
    attempts: AtomicUsize,
    fail_on: HashSet<String>,
    delay: Duration,
    history: Option<Vec<(String, ContentKind)>>,
}

impl RecordingPublisher {
    fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl PublishTarget for RecordingPublisher {
    async fn publish(&self, item: &ContentItem) -> Result<PublishedRef, PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_on.contains(&item.fingerprint) {
            return Err(PublishError::Rejected {
                status: 400,
                message: "unpublishable".into(),
            });
        }
        self.published.lock().unwrap().push(item.fingerprint.clone());
        self.summaries.lock().unwrap().push(item.payload.summary.clone());
        Ok(PublishedRef {
            target: "recording".into(),
            message_id: None,
        })
    }

    async fn recent_fingerprints(&self) -> Result<Vec<(String, ContentKind)>, PublishError> {
        self.history
            .clone()
            .ok_or(PublishError::Unconfigured("history"))
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[derive(Default)]
struct IngestUpstream {
    ingested: Mutex<Vec<String>>,
    fail_ingest: AtomicBool,
    summary_reply: Option<&'static str>,
    prompts: Mutex<Vec<String>>,
}

impl IngestUpstream {
    fn ingested(&self) -> Vec<String> {
        self.ingested.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for IngestUpstream {
    async fn create_session(&self) -> Result<Session, ClientError> {
        Ok(Session::new("unused"))
    }

    async fn respond(&self, _: &Session, query: &str) -> Result<ResponseStream, ClientError> {
        self.prompts.lock().unwrap().push(query.to_string());
        match self.summary_reply {
            Some(text) => Ok(Box::pin(futures::stream::iter(vec![Ok(text.to_string())]))),
            None => Err(ClientError::Stream("no replies".into())),
        }
    }

    async fn ingest(&self, url: &str) -> Result<IngestAck, ClientError> {
        if self.fail_ingest.load(Ordering::SeqCst) {
            return Err(ClientError::Api {
                status: 503,
                message: "kb down".into(),
            });
        }
        self.ingested.lock().unwrap().push(url.to_string());
        Ok(IngestAck::Accepted)
    }

    fn name(&self) -> &str {
        "ingest-fake"
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn item(fingerprint: &str, kind: ContentKind) -> ContentItem {
    let link = match kind {
        ContentKind::Video => format!(
            "https://www.youtube.com/watch?v={}",
            fingerprint.trim_start_matches("video:")
        ),
        ContentKind::Article => fingerprint.trim_start_matches("article:").to_string(),
    };
    ContentItem {
        fingerprint: fingerprint.to_string(),
        kind,
        source_name: "test".into(),
        published_at: None,
        payload: ContentPayload {
            title: format!("Title for {}", fingerprint),
            body: None,
            link,
            thumbnail_url: None,
            author: None,
            summary: None,
        },
    }
}

fn db_config(dir: &tempfile::TempDir) -> DatabaseConfig {
    DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("herald.db").display()),
        max_connections: 5,
    }
}

async fn open_store(dir: &tempfile::TempDir) -> DedupStore {
    DedupStore::new(db::connect(&db_config(dir)).await.expect("connect"))
}

fn client(upstream: Arc<IngestUpstream>) -> Arc<ServiceClient> {
    Arc::new(ServiceClient::new(
        upstream,
        5,
        RetryPolicy {
            max_attempts: 2,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            attempt_timeout: Duration::from_secs(5),
        },
    ))
}

fn settings() -> SyncSettings {
    SyncSettings {
        retention: chrono::Duration::days(90),
        run_on_start: true,
        publish_spacing: IntervalBand::fixed(Duration::ZERO),
        shutdown_timeout: Duration::from_secs(5),
        summarize_articles: false,
    }
}

fn hourly() -> IntervalBand {
    IntervalBand::new(Duration::from_secs(3600), Duration::from_secs(7200))
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_same_item_on_two_ticks_is_published_once() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let upstream = Arc::new(IngestUpstream::default());
    let producer = Arc::new(StaticProducer::new(
        ContentKind::Video,
        vec![item("video:abc123", ContentKind::Video)],
    ));

    let scheduler = ContentSyncScheduler::new(
        open_store(&dir).await,
        publisher.clone(),
        client(upstream.clone()),
        settings(),
    )
    .with_stream(StreamSpec::new("videos", producer, hourly()));

    let first = scheduler.run_tick("videos").await.expect("stream exists");
    let second = scheduler.run_tick("videos").await.expect("stream exists");

    assert_eq!(first.published, 1);
    assert_eq!(first.ingested, 1);
    assert_eq!(second.published, 0);
    assert_eq!(second.already_seen, 1);
    assert_eq!(publisher.published(), vec!["video:abc123"]);
    assert_eq!(
        upstream.ingested(),
        vec!["https://www.youtube.com/watch?v=abc123"]
    );
}

#[tokio::test]
async fn test_restart_with_populated_store_publishes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fingerprints = ["video:one", "video:two", "video:three"];

    {
        let store = open_store(&dir).await;
        for fp in fingerprints {
            assert!(store.insert_if_absent(fp, ContentKind::Video).await.unwrap());
        }
    }

    // Fresh pool over the same file, as after a process restart.
    let publisher = Arc::new(RecordingPublisher {
        history: Some(vec![("video:from-history".into(), ContentKind::Video)]),
        ..Default::default()
    });
    let producer = Arc::new(StaticProducer::new(
        ContentKind::Video,
        fingerprints.iter().map(|fp| item(fp, ContentKind::Video)).collect(),
    ));
    let scheduler = ContentSyncScheduler::new(
        open_store(&dir).await,
        publisher.clone(),
        client(Arc::new(IngestUpstream::default())),
        settings(),
    )
    .with_stream(StreamSpec::new("videos", producer, hourly()));

    let reconcile = scheduler.reconcile().await;
    assert_eq!(reconcile.known, 3);
    assert_eq!(reconcile.seeded, 0, "history is only read when the store is empty");

    let report = scheduler.run_tick("videos").await.unwrap();
    assert_eq!(report.already_seen, 3);
    assert_eq!(publisher.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_publish_failure_is_seen_and_does_not_block_next_item() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher {
        fail_on: ["article:https://example.com/broken".to_string()].into(),
        ..Default::default()
    });
    let upstream = Arc::new(IngestUpstream::default());
    let producer = Arc::new(StaticProducer::new(
        ContentKind::Article,
        vec![
            item("article:https://example.com/broken", ContentKind::Article),
            item("article:https://example.com/fine", ContentKind::Article),
        ],
    ));
    let store = open_store(&dir).await;

    let scheduler = ContentSyncScheduler::new(
        store.clone(),
        publisher.clone(),
        client(upstream.clone()),
        settings(),
    )
    .with_stream(StreamSpec::new("articles", producer, hourly()));

    let report = scheduler.run_tick("articles").await.unwrap();
    assert_eq!(report.publish_failed, 1);
    assert_eq!(report.published, 1);
    assert_eq!(publisher.published(), vec!["article:https://example.com/fine"]);
    assert_eq!(upstream.ingested(), vec!["https://example.com/fine"]);
    assert!(store.contains("article:https://example.com/broken").await.unwrap());

    let again = scheduler.run_tick("articles").await.unwrap();
    assert_eq!(again.already_seen, 2);
    assert_eq!(publisher.attempts.load(Ordering::SeqCst), 2, "failed item is not retried");
}

#[tokio::test]
async fn test_ingest_failure_keeps_publish_and_dedup_state() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let upstream = Arc::new(IngestUpstream {
        fail_ingest: AtomicBool::new(true),
        ..Default::default()
    });
    let producer = Arc::new(StaticProducer::new(
        ContentKind::Video,
        vec![
            item("video:aaa", ContentKind::Video),
            item("video:bbb", ContentKind::Video),
        ],
    ));

    let scheduler = ContentSyncScheduler::new(
        open_store(&dir).await,
        publisher.clone(),
        client(upstream.clone()),
        settings(),
    )
    .with_stream(StreamSpec::new("videos", producer, hourly()));

    let report = scheduler.run_tick("videos").await.unwrap();
    assert_eq!(report.published, 2);
    assert_eq!(report.ingest_failed, 2);
    assert_eq!(report.ingested, 0);

    let again = scheduler.run_tick("videos").await.unwrap();
    assert_eq!(again.published, 0, "ingest failure must not cause re-publication");
    assert_eq!(again.ingest_retried, 2);
    assert_eq!(again.ingest_recovered, 0);
    assert!(upstream.ingested().is_empty());
}

#[tokio::test]
async fn test_failed_ingest_is_uploaded_on_next_tick_without_republishing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let publisher = Arc::new(RecordingPublisher::default());
    let upstream = Arc::new(IngestUpstream {
        fail_ingest: AtomicBool::new(true),
        ..Default::default()
    });
    let producer = Arc::new(StaticProducer::new(
        ContentKind::Video,
        vec![item("video:late", ContentKind::Video)],
    ));

    let scheduler = ContentSyncScheduler::new(
        store.clone(),
        publisher.clone(),
        client(upstream.clone()),
        settings(),
    )
    .with_stream(StreamSpec::new("videos", producer, hourly()));

    let first = scheduler.run_tick("videos").await.unwrap();
    assert_eq!(first.published, 1);
    assert_eq!(first.ingest_failed, 1);
    assert_eq!(store.pending_ingest_count().await.unwrap(), 1);

    upstream.fail_ingest.store(false, Ordering::SeqCst);
    let second = scheduler.run_tick("videos").await.unwrap();
    assert_eq!(second.published, 0);
    assert_eq!(second.already_seen, 1);
    assert_eq!(second.ingest_retried, 1);
    assert_eq!(second.ingest_recovered, 1);
    assert_eq!(
        upstream.ingested(),
        vec!["https://www.youtube.com/watch?v=late"]
    );
    assert_eq!(publisher.published(), vec!["video:late"]);
    assert_eq!(store.pending_ingest_count().await.unwrap(), 0);

    let third = scheduler.run_tick("videos").await.unwrap();
    assert_eq!(third.ingest_retried, 0);
    assert_eq!(upstream.ingested().len(), 1);
}

#[tokio::test]
async fn test_pending_ingest_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let producer = Arc::new(StaticProducer::new(
        ContentKind::Article,
        vec![item("article:https://example.com/p", ContentKind::Article)],
    ));

    let failing = Arc::new(IngestUpstream {
        fail_ingest: AtomicBool::new(true),
        ..Default::default()
    });
    let first = ContentSyncScheduler::new(
        open_store(&dir).await,
        publisher.clone(),
        client(failing),
        settings(),
    )
    .with_stream(StreamSpec::new("articles", producer.clone(), hourly()));
    first.run_tick("articles").await.unwrap();
    first.stop().await;

    let healthy = Arc::new(IngestUpstream::default());
    let second = ContentSyncScheduler::new(
        open_store(&dir).await,
        publisher.clone(),
        client(healthy.clone()),
        settings(),
    )
    .with_stream(StreamSpec::new("articles", producer, hourly()));
    let report = second.run_tick("articles").await.unwrap();

    assert_eq!(report.ingest_recovered, 1);
    assert_eq!(report.published, 0);
    assert_eq!(healthy.ingested(), vec!["https://example.com/p"]);
    assert_eq!(publisher.published().len(), 1);
}

#[tokio::test]
async fn test_failing_stream_does_not_affect_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let articles = Arc::new(StaticProducer {
        fail: true,
        ..StaticProducer::new(ContentKind::Article, Vec::new())
    });
    let slow_articles = Arc::new(StaticProducer {
        delay: Duration::from_secs(3600),
        ..StaticProducer::new(ContentKind::Article, Vec::new())
    });
    let videos = Arc::new(StaticProducer::new(
        ContentKind::Video,
        vec![item("video:independent", ContentKind::Video)],
    ));

    let scheduler = ContentSyncScheduler::new(
        open_store(&dir).await,
        publisher.clone(),
        client(Arc::new(IngestUpstream::default())),
        SyncSettings {
            shutdown_timeout: Duration::from_millis(200),
            ..settings()
        },
    )
    .with_stream(StreamSpec::new("articles", articles.clone(), hourly()))
    .with_stream(StreamSpec::new("slow-articles", slow_articles, hourly()))
    .with_stream(StreamSpec::new("videos", videos, hourly()));

    scheduler.start().await;
    wait_for(|| publisher.published().len() == 1).await;
    wait_for(|| {
        scheduler
            .status()
            .iter()
            .any(|s| s.name == "articles" && s.last_report.is_some())
    })
    .await;

    let status = scheduler.status();
    let article_status = status.iter().find(|s| s.name == "articles").unwrap();
    assert!(article_status.last_report.as_ref().unwrap().producer_failed);
    assert_eq!(article_status.phase, SyncPhase::Idle);
    assert!(article_status.schedule.next_run_at.is_some());
    assert_eq!(articles.calls.load(Ordering::SeqCst), 1);

    // The hung producer is only cut off by the shutdown timeout.
    assert!(!scheduler.stop().await);
}

#[tokio::test]
async fn test_stop_finishes_in_flight_item() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher {
        delay: Duration::from_millis(200),
        ..Default::default()
    });
    let upstream = Arc::new(IngestUpstream::default());
    let producer = Arc::new(StaticProducer::new(
        ContentKind::Article,
        vec![
            item("article:https://example.com/1", ContentKind::Article),
            item("article:https://example.com/2", ContentKind::Article),
            item("article:https://example.com/3", ContentKind::Article),
        ],
    ));
    let store = open_store(&dir).await;

    let scheduler = ContentSyncScheduler::new(
        store.clone(),
        publisher.clone(),
        client(upstream.clone()),
        settings(),
    )
    .with_stream(StreamSpec::new("articles", producer, hourly()));

    scheduler.start().await;
    wait_for(|| publisher.attempts.load(Ordering::SeqCst) == 1).await;

    assert!(scheduler.stop().await, "stop should be graceful");

    // The in-flight item completed both side effects; the rest were left unseen.
    assert_eq!(publisher.published(), vec!["article:https://example.com/1"]);
    assert_eq!(upstream.ingested(), vec!["https://example.com/1"]);
    assert!(!store.contains("article:https://example.com/2").await.unwrap());
    assert!(scheduler
        .status()
        .iter()
        .all(|s| s.phase == SyncPhase::Stopped));
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn test_stop_times_out_on_stuck_item() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher {
        delay: Duration::from_secs(3600),
        ..Default::default()
    });
    let producer = Arc::new(StaticProducer::new(
        ContentKind::Video,
        vec![item("video:stuck", ContentKind::Video)],
    ));

    let scheduler = ContentSyncScheduler::new(
        open_store(&dir).await,
        publisher.clone(),
        client(Arc::new(IngestUpstream::default())),
        SyncSettings {
            shutdown_timeout: Duration::from_millis(100),
            ..settings()
        },
    )
    .with_stream(StreamSpec::new("videos", producer, hourly()));

    scheduler.start().await;
    wait_for(|| {
        scheduler
            .status()
            .iter()
            .any(|s| s.in_flight.as_deref() == Some("video:stuck"))
    })
    .await;

    assert!(!scheduler.stop().await);
    assert!(publisher.published().is_empty());
}

#[tokio::test]
async fn test_first_run_seeds_store_from_publish_history() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher {
        history: Some(vec![("video:posted-before".into(), ContentKind::Video)]),
        ..Default::default()
    });
    let producer = Arc::new(StaticProducer::new(
        ContentKind::Video,
        vec![
            item("video:posted-before", ContentKind::Video),
            item("video:brand-new", ContentKind::Video),
        ],
    ));

    let scheduler = ContentSyncScheduler::new(
        open_store(&dir).await,
        publisher.clone(),
        client(Arc::new(IngestUpstream::default())),
        settings(),
    )
    .with_stream(StreamSpec::new("videos", producer, hourly()));

    let reconcile = scheduler.reconcile().await;
    assert_eq!(reconcile.seeded, 1);

    let report = scheduler.run_tick("videos").await.unwrap();
    assert_eq!(report.already_seen, 1);
    assert_eq!(publisher.published(), vec!["video:brand-new"]);
}

#[tokio::test]
async fn test_unknown_stream_tick_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = ContentSyncScheduler::new(
        open_store(&dir).await,
        Arc::new(RecordingPublisher::default()),
        client(Arc::new(IngestUpstream::default())),
        settings(),
    );
    assert!(scheduler.run_tick("nope").await.is_none());
}

#[tokio::test]
async fn test_backfill_uploads_without_publishing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    store
        .insert_if_absent("video:already", ContentKind::Video)
        .await
        .unwrap();
    let upstream = Arc::new(IngestUpstream::default());
    let producer = StaticProducer::new(
        ContentKind::Video,
        vec![
            item("video:already", ContentKind::Video),
            item("video:old-upload", ContentKind::Video),
        ],
    );

    let report = run_backfill(&producer, &store, &client(upstream.clone()), Duration::ZERO)
        .await
        .expect("backfill");

    assert_eq!(report.fetched, 2);
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(
        upstream.ingested(),
        vec!["https://www.youtube.com/watch?v=old-upload"]
    );
    assert!(store.contains("video:old-upload").await.unwrap());
}

#[tokio::test]
async fn test_failed_backfill_upload_is_queued_for_the_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let upstream = Arc::new(IngestUpstream {
        fail_ingest: AtomicBool::new(true),
        ..Default::default()
    });
    let producer = StaticProducer::new(
        ContentKind::Video,
        vec![item("video:backlog", ContentKind::Video)],
    );

    let report = run_backfill(&producer, &store, &client(upstream), Duration::ZERO)
        .await
        .expect("backfill");

    assert_eq!(report.failed, 1);
    let pending = store.pending_ingests(ContentKind::Video, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].link, "https://www.youtube.com/watch?v=backlog");
}

fn article_with_body(fingerprint: &str) -> ContentItem {
    let mut article = item(fingerprint, ContentKind::Article);
    article.payload.body = Some("A long abstract about retrieval.".into());
    article
}

#[tokio::test]
async fn test_articles_are_published_with_summary_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let upstream = Arc::new(IngestUpstream {
        summary_reply: Some("Key Points: retrieval helps."),
        ..Default::default()
    });
    let producer = Arc::new(StaticProducer::new(
        ContentKind::Article,
        vec![article_with_body("article:https://example.com/s")],
    ));

    let scheduler = ContentSyncScheduler::new(
        open_store(&dir).await,
        publisher.clone(),
        client(upstream.clone()),
        SyncSettings {
            summarize_articles: true,
            ..settings()
        },
    )
    .with_stream(StreamSpec::new("articles", producer, hourly()));

    let report = scheduler.run_tick("articles").await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(
        *publisher.summaries.lock().unwrap(),
        vec![Some("Key Points: retrieval helps.".to_string())]
    );
    let prompts = upstream.prompts.lock().unwrap();
    assert!(prompts[0].contains("A long abstract about retrieval."));
}

#[tokio::test]
async fn test_summary_failure_still_publishes_article() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    let upstream = Arc::new(IngestUpstream::default());
    let producer = Arc::new(StaticProducer::new(
        ContentKind::Article,
        vec![article_with_body("article:https://example.com/t")],
    ));

    let scheduler = ContentSyncScheduler::new(
        open_store(&dir).await,
        publisher.clone(),
        client(upstream.clone()),
        SyncSettings {
            summarize_articles: true,
            ..settings()
        },
    )
    .with_stream(StreamSpec::new("articles", producer, hourly()));

    let report = scheduler.run_tick("articles").await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(report.ingested, 1);
    assert_eq!(*publisher.summaries.lock().unwrap(), vec![None]);
}
