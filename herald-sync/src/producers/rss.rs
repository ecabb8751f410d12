//! RSS 2.0 article producer. Only the feed's own fields are used; article
//! bodies are not scraped.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::config::FeedSource;
use herald_core::models::{ContentItem, ContentKind, ContentPayload};
use quick_xml::de::from_str;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::fingerprint::article_fingerprint;
use crate::producer::ContentProducer;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    author: Option<String>,
}

pub struct RssProducer {
    client: Client,
    feeds: Vec<FeedSource>,
}

impl RssProducer {
    pub fn new(feeds: Vec<FeedSource>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building RSS HTTP client")?;
        Ok(Self { client, feeds })
    }

    async fn fetch_feed(&self, feed: &FeedSource) -> Result<Vec<ContentItem>> {
        let response = self
            .client
            .get(&feed.url)
            .send()
            .await
            .with_context(|| format!("fetching feed {}", feed.name))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("feed {} returned HTTP {}", feed.name, status.as_u16()));
        }
        let body = response
            .text()
            .await
            .with_context(|| format!("reading feed {}", feed.name))?;
        parse_feed(&body, &feed.name)
    }
}

/// Parse an RSS document into article items. Items without a usable link
/// are dropped.
pub fn parse_feed(xml: &str, source_name: &str) -> Result<Vec<ContentItem>> {
    let rss: Rss = from_str(xml).with_context(|| format!("parsing rss xml for {}", source_name))?;
    let mut out = Vec::with_capacity(rss.channel.item.len());

    for it in rss.channel.item {
        let Some(link) = it.link.map(|l| l.trim().to_string()) else {
            continue;
        };
        let Some(fingerprint) = article_fingerprint(&link) else {
            tracing::debug!(source = source_name, link = %link, "Skipping item with unusable link");
            continue;
        };

        let title = it
            .title
            .as_deref()
            .map(|t| html_escape::decode_html_entities(t.trim()).into_owned())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| link.clone());

        out.push(ContentItem {
            fingerprint,
            kind: ContentKind::Article,
            source_name: source_name.to_string(),
            published_at: it
                .pub_date
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc2822(s.trim()).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            payload: ContentPayload {
                title,
                body: it
                    .description
                    .map(|d| html_escape::decode_html_entities(d.trim()).into_owned())
                    .filter(|d| !d.is_empty()),
                link,
                thumbnail_url: None,
                author: it.author,
                summary: None,
            },
        });
    }

    Ok(out)
}

#[async_trait]
impl ContentProducer for RssProducer {
    async fn fetch(&self) -> Result<Vec<ContentItem>> {
        let mut items = Vec::new();
        let mut failures = 0usize;

        for feed in &self.feeds {
            match self.fetch_feed(feed).await {
                Ok(found) => {
                    tracing::debug!(feed = %feed.name, articles = found.len(), "Fetched feed");
                    items.extend(found);
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(feed = %feed.name, error = %e, "Feed fetch failed");
                }
            }
        }

        if failures > 0 && failures == self.feeds.len() {
            return Err(anyhow!("all {} feeds failed", failures));
        }
        Ok(items)
    }

    fn kind(&self) -> ContentKind {
        ContentKind::Article
    }

    fn name(&self) -> &str {
        "rss"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <item>
      <title>Agents &amp; the web</title>
      <link>https://example.com/posts/agents/?utm_source=rss</link>
      <pubDate>Tue, 13 Oct 2026 09:30:00 GMT</pubDate>
      <description>A look at agents.</description>
    </item>
    <item>
      <title>No link here</title>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_feed_maps_items() {
        let items = parse_feed(FEED, "Example").expect("parse");

        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.fingerprint, "article:https://example.com/posts/agents");
        assert_eq!(item.payload.title, "Agents & the web");
        assert_eq!(item.payload.body.as_deref(), Some("A look at agents."));
        assert_eq!(item.source_name, "Example");
        assert!(item.published_at.is_some());
    }

    #[test]
    fn test_empty_channel_parses_to_nothing() {
        let xml = r#"<rss version="2.0"><channel><title>Empty</title></channel></rss>"#;
        assert!(parse_feed(xml, "Empty").expect("parse").is_empty());
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        assert!(parse_feed("<rss><channel>", "Broken").is_err());
    }

    #[tokio::test]
    async fn test_fetch_isolates_failing_feed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/down.xml"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let producer = RssProducer::new(vec![
            FeedSource {
                name: "Down".into(),
                url: format!("{}/down.xml", server.uri()),
            },
            FeedSource {
                name: "Good".into(),
                url: format!("{}/good.xml", server.uri()),
            },
        ])
        .unwrap();

        let items = producer.fetch().await.expect("one feed still works");
        assert_eq!(items.len(), 1);
    }
}
