//! YouTube Data API v3 producer.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::config::{ChannelSource, VideoStreamConfig};
use herald_core::models::{ContentItem, ContentKind, ContentPayload};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::fingerprint::{video_fingerprint, watch_url};
use crate::producer::ContentProducer;

const BACKFILL_PAGE_SIZE: u32 = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchId,
    snippet: Snippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    title: String,
    #[serde(default)]
    description: String,
    published_at: Option<String>,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnails {
    high: Option<Thumbnail>,
    medium: Option<Thumbnail>,
    default: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Latest uploads within the lookback window.
    Recent,
    /// Every upload, page by page.
    FullHistory,
}

pub struct YouTubeProducer {
    client: Client,
    base_url: String,
    api_key: String,
    channels: Vec<ChannelSource>,
    lookback_days: u64,
    max_results: u32,
    mode: Mode,
}

impl YouTubeProducer {
    pub fn new(config: &VideoStreamConfig) -> Result<Self> {
        Self::with_base_url(config, "https://www.googleapis.com/youtube/v3".to_string())
    }

    /// Create a producer with a custom base URL (for testing / integration)
    pub fn with_base_url(config: &VideoStreamConfig, base_url: String) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(anyhow!("YouTube API key is not configured"));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building YouTube HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            channels: config.channels.clone(),
            lookback_days: config.lookback_days,
            max_results: config.max_results,
            mode: Mode::Recent,
        })
    }

    /// Switch to walking each channel's complete upload history.
    pub fn full_history(mut self) -> Self {
        self.mode = Mode::FullHistory;
        self
    }

    async fn search_page(
        &self,
        channel: &ChannelSource,
        page_token: Option<&str>,
        max_results: u32,
        published_after: Option<DateTime<Utc>>,
    ) -> Result<SearchResponse> {
        let url = format!("{}/search", self.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("part", "snippet".to_string()),
            ("channelId", channel.channel_id.clone()),
            ("order", "date".to_string()),
            ("type", "video".to_string()),
            ("maxResults", max_results.to_string()),
            ("key", self.api_key.clone()),
        ];
        if let Some(after) = published_after {
            query.push(("publishedAfter", after.format("%Y-%m-%dT%H:%M:%SZ").to_string()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("YouTube search request for {}", channel.name))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "YouTube API error ({}) for {}: {}",
                status.as_u16(),
                channel.name,
                body
            ));
        }

        response
            .json::<SearchResponse>()
            .await
            .with_context(|| format!("parsing YouTube search response for {}", channel.name))
    }

    async fn fetch_recent(&self, channel: &ChannelSource) -> Result<Vec<ContentItem>> {
        let after = Utc::now() - chrono::Duration::days(self.lookback_days as i64);
        let page = self
            .search_page(channel, None, self.max_results, Some(after))
            .await?;
        Ok(page
            .items
            .into_iter()
            .filter_map(|item| to_content_item(item, &channel.name))
            .collect())
    }

    /// Every video on a channel, following `nextPageToken` until it runs out.
    /// A failed page after the first ends the walk with what was collected.
    pub async fn fetch_all_pages(&self, channel: &ChannelSource) -> Result<Vec<ContentItem>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = match self
                .search_page(channel, token.as_deref(), BACKFILL_PAGE_SIZE, None)
                .await
            {
                Ok(page) => page,
                Err(e) if pages > 0 => {
                    tracing::warn!(channel = %channel.name, pages, error = %e, "Stopping history walk early");
                    break;
                }
                Err(e) => return Err(e),
            };
            pages += 1;

            if page.items.is_empty() {
                break;
            }
            out.extend(
                page.items
                    .into_iter()
                    .filter_map(|item| to_content_item(item, &channel.name)),
            );

            match page.next_page_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }

        tracing::info!(channel = %channel.name, pages, videos = out.len(), "Walked channel history");
        Ok(out)
    }
}

fn to_content_item(item: SearchItem, channel_name: &str) -> Option<ContentItem> {
    let video_id = item.id.video_id?;
    let snippet = item.snippet;
    let thumbnail_url = snippet
        .thumbnails
        .high
        .or(snippet.thumbnails.medium)
        .or(snippet.thumbnails.default)
        .map(|t| t.url);
    let published_at = snippet
        .published_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let description = html_escape::decode_html_entities(&snippet.description).into_owned();

    Some(ContentItem {
        fingerprint: video_fingerprint(&video_id),
        kind: ContentKind::Video,
        source_name: channel_name.to_string(),
        published_at,
        payload: ContentPayload {
            title: html_escape::decode_html_entities(&snippet.title).into_owned(),
            body: (!description.trim().is_empty()).then_some(description),
            link: watch_url(&video_id),
            thumbnail_url,
            author: Some(channel_name.to_string()),
            summary: None,
        },
    })
}

#[async_trait]
impl ContentProducer for YouTubeProducer {
    async fn fetch(&self) -> Result<Vec<ContentItem>> {
        let mut items = Vec::new();
        let mut failures = 0usize;

        for channel in &self.channels {
            let result = match self.mode {
                Mode::Recent => self.fetch_recent(channel).await,
                Mode::FullHistory => self.fetch_all_pages(channel).await,
            };
            match result {
                Ok(found) => {
                    tracing::debug!(channel = %channel.name, videos = found.len(), "Fetched channel");
                    items.extend(found);
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(channel = %channel.name, error = %e, "YouTube channel fetch failed");
                }
            }
        }

        if failures > 0 && failures == self.channels.len() {
            return Err(anyhow!("all {} YouTube channels failed", failures));
        }
        Ok(items)
    }

    fn kind(&self) -> ContentKind {
        ContentKind::Video
    }

    fn name(&self) -> &str {
        "youtube"
    }
}
