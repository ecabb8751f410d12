//! Build the running components from a loaded [`HeraldConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use herald_core::{DedupStore, HeraldConfig, HttpUpstream, RetryPolicy, ServiceClient, SessionRegistry};
use herald_sync::{
    run_backfill, BackfillReport, ContentProducer, ContentSyncScheduler, DiscordPublisher,
    IntervalBand, RssProducer, StreamSpec, SyncSettings, YouTubeProducer,
};
use sqlx::SqlitePool;

use crate::http::HttpState;

/// Spacing between knowledge base uploads during a backfill.
const BACKFILL_UPLOAD_SPACING: Duration = Duration::from_secs(1);

pub fn build_client(config: &HeraldConfig) -> Result<Arc<ServiceClient>> {
    let upstream = HttpUpstream::new(&config.upstream).context("creating upstream backend")?;
    Ok(Arc::new(ServiceClient::new(
        Arc::new(upstream),
        config.client.concurrency,
        RetryPolicy::from_config(&config.client),
    )))
}

/// `None` when sync is disabled or no stream has any sources configured.
pub fn build_scheduler(
    config: &HeraldConfig,
    pool: SqlitePool,
    client: Arc<ServiceClient>,
) -> Result<Option<ContentSyncScheduler>> {
    let sync = &config.sync;
    if !sync.enabled {
        tracing::info!("Content sync disabled");
        return Ok(None);
    }

    let publisher = DiscordPublisher::new(&config.publish).context("creating Discord publisher")?;
    let mut scheduler = ContentSyncScheduler::new(
        DedupStore::new(pool),
        Arc::new(publisher),
        client,
        SyncSettings::from_config(sync),
    );
    let mut streams = 0;

    if !sync.articles.feeds.is_empty() {
        let producer = RssProducer::new(sync.articles.feeds.clone())?;
        scheduler = scheduler.with_stream(StreamSpec::new(
            "articles",
            Arc::new(producer),
            IntervalBand::from_hours(sync.articles.interval_hours),
        ));
        streams += 1;
    }

    if !sync.videos.channels.is_empty() {
        let producer = YouTubeProducer::new(&sync.videos)?;
        scheduler = scheduler.with_stream(StreamSpec::new(
            "videos",
            Arc::new(producer),
            IntervalBand::from_hours(sync.videos.interval_hours),
        ));
        streams += 1;
    }

    if streams == 0 {
        tracing::warn!("Content sync enabled but no feeds or channels configured");
        return Ok(None);
    }
    Ok(Some(scheduler))
}

pub fn build_http_state(
    pool: SqlitePool,
    client: Arc<ServiceClient>,
    scheduler: Option<Arc<ContentSyncScheduler>>,
) -> Arc<HttpState> {
    Arc::new(HttpState {
        registry: SessionRegistry::new(pool.clone()),
        pool,
        client,
        scheduler,
    })
}

/// Upload every configured channel's full history and every feed's current
/// items to the knowledge base, without publishing.
pub async fn backfill(
    config: &HeraldConfig,
    pool: SqlitePool,
    client: &ServiceClient,
) -> Result<Vec<(&'static str, BackfillReport)>> {
    let store = DedupStore::new(pool);
    let mut producers: Vec<(&'static str, Box<dyn ContentProducer>)> = Vec::new();

    if !config.sync.videos.channels.is_empty() {
        let producer = YouTubeProducer::new(&config.sync.videos)?.full_history();
        producers.push(("videos", Box::new(producer)));
    }
    if !config.sync.articles.feeds.is_empty() {
        producers.push(("articles", Box::new(RssProducer::new(config.sync.articles.feeds.clone())?)));
    }

    let mut reports = Vec::new();
    for (name, producer) in &producers {
        let report = run_backfill(producer.as_ref(), &store, client, BACKFILL_UPLOAD_SPACING)
            .await
            .with_context(|| format!("backfilling {}", name))?;
        reports.push((*name, report));
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::config::{ChannelSource, FeedSource};

    fn base_config() -> HeraldConfig {
        let mut config = HeraldConfig::default();
        config.upstream.chatbot_uuid = "bot-1".into();
        config.upstream.api_token = "token".into();
        config.publish.webhook_url = "https://discord.example/api/webhooks/1/abc".into();
        config
    }

    async fn pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let db = herald_core::config::DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("herald.db").display()),
            max_connections: 2,
        };
        let pool = herald_core::db::connect(&db).await.unwrap();
        (dir, pool)
    }

    #[test]
    fn test_build_client_requires_token() {
        let mut config = base_config();
        config.upstream.api_token = String::new();
        assert!(build_client(&config).is_err());

        let client = build_client(&base_config()).unwrap();
        assert_eq!(client.concurrency(), config.client.concurrency);
    }

    #[tokio::test]
    async fn test_scheduler_streams_follow_configured_sources() {
        let (_dir, pool) = pool().await;
        let mut config = base_config();
        config.sync.articles.feeds = vec![FeedSource {
            name: "blog".into(),
            url: "https://example.com/feed.xml".into(),
        }];
        let client = build_client(&config).unwrap();

        let scheduler = build_scheduler(&config, pool.clone(), client.clone())
            .unwrap()
            .expect("articles stream configured");
        let names: Vec<String> = scheduler.status().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["articles"]);

        config.sync.videos.api_key = "yt-key".into();
        config.sync.videos.channels = vec![ChannelSource {
            name: "Synaptic".into(),
            channel_id: "UC123".into(),
        }];
        let scheduler = build_scheduler(&config, pool, client).unwrap().unwrap();
        assert_eq!(scheduler.status().len(), 2);
    }

    #[tokio::test]
    async fn test_scheduler_absent_when_disabled_or_empty() {
        let (_dir, pool) = pool().await;
        let mut config = base_config();
        let client = build_client(&config).unwrap();

        assert!(build_scheduler(&config, pool.clone(), client.clone())
            .unwrap()
            .is_none());

        config.sync.enabled = false;
        config.sync.articles.feeds = vec![FeedSource {
            name: "blog".into(),
            url: "https://example.com/feed.xml".into(),
        }];
        assert!(build_scheduler(&config, pool, client).unwrap().is_none());
    }
}
