//! Discord publish target: posts through a channel webhook, reads history
//! through the bot API.

use async_trait::async_trait;
use herald_core::config::PublishConfig;
use herald_core::models::{ContentItem, ContentKind};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::fingerprint::{extract_urls, fingerprint_for_url};
use crate::publisher::{PublishError, PublishTarget, PublishedRef};

const DISCORD_API: &str = "https://discord.com/api/v10";
const VIDEO_EMBED_COLOR: u32 = 0xE74C3C;
const ARTICLE_EMBED_COLOR: u32 = 0x3498DB;
/// Embed descriptions are kept well under Discord's 4096 limit.
const SUMMARY_MAX_CHARS: usize = 1000;
/// Discord caps channel history reads at 100 messages per request.
const HISTORY_PAGE_MAX: u32 = 100;

#[derive(Serialize)]
struct WebhookPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embeds: Vec<Embed>,
}

#[derive(Serialize)]
struct Embed {
    title: String,
    url: String,
    color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<EmbedFooter>,
}

#[derive(Serialize)]
struct EmbedImage {
    url: String,
}

#[derive(Serialize)]
struct EmbedFooter {
    text: String,
}

#[derive(Debug, Deserialize)]
struct CreatedMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    embeds: Vec<HistoryEmbed>,
}

#[derive(Debug, Deserialize)]
struct HistoryEmbed {
    url: Option<String>,
}

impl WebhookPayload {
    /// Articles go out as their bare link so Discord unfurls them, or as an
    /// embed when they carry a summary. Videos are an embed with the thumbnail.
    fn for_item(item: &ContentItem) -> Self {
        match item.kind {
            ContentKind::Article => match &item.payload.summary {
                Some(summary) => Self {
                    content: None,
                    embeds: vec![Embed {
                        title: truncate(&item.payload.title, 256),
                        url: item.payload.link.clone(),
                        color: ARTICLE_EMBED_COLOR,
                        description: Some(format_summary(summary)),
                        image: None,
                        footer: Some(EmbedFooter {
                            text: format!(
                                "{} • {}",
                                item.published_at
                                    .map(|d| d.format("%Y-%m-%d").to_string())
                                    .unwrap_or_else(|| "Unknown date".to_string()),
                                item.source_name
                            ),
                        }),
                    }],
                },
                None => Self {
                    content: Some(item.payload.link.clone()),
                    embeds: Vec::new(),
                },
            },
            ContentKind::Video => Self {
                content: None,
                embeds: vec![Embed {
                    title: truncate(&item.payload.title, 256),
                    url: item.payload.link.clone(),
                    color: VIDEO_EMBED_COLOR,
                    description: None,
                    image: item
                        .payload
                        .thumbnail_url
                        .clone()
                        .map(|url| EmbedImage { url }),
                    footer: item.payload.author.as_ref().map(|a| EmbedFooter {
                        text: format!("Posted by {}", a),
                    }),
                }],
            },
        }
    }
}

/// Cut a long summary back to its last full sentence.
fn format_summary(summary: &str) -> String {
    let summary = summary.trim();
    if summary.chars().count() <= SUMMARY_MAX_CHARS {
        return summary.to_string();
    }
    let head: String = summary.chars().take(SUMMARY_MAX_CHARS).collect();
    match head.rfind('.') {
        Some(end) if end > 0 => format!("{}...", &head[..=end]),
        _ => format!("{}...", head.chars().take(SUMMARY_MAX_CHARS - 3).collect::<String>()),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars - 1).collect();
        out.push('…');
        out
    }
}

#[derive(Clone)]
pub struct DiscordPublisher {
    client: Client,
    webhook_url: String,
    api_base: String,
    bot: Option<(String, String)>,
    history_limit: u32,
}

impl DiscordPublisher {
    pub fn new(config: &PublishConfig) -> Result<Self, PublishError> {
        Self::with_api_base(config, DISCORD_API.to_string())
    }

    /// Create a publisher with a custom bot API base (for testing / integration)
    pub fn with_api_base(config: &PublishConfig, api_base: String) -> Result<Self, PublishError> {
        if config.webhook_url.trim().is_empty() {
            return Err(PublishError::Unconfigured("webhook_url"));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let bot = match (&config.bot_token, &config.channel_id) {
            (Some(token), Some(channel)) if !token.is_empty() && !channel.is_empty() => {
                Some((token.clone(), channel.clone()))
            }
            _ => None,
        };

        Ok(Self {
            client,
            webhook_url: config.webhook_url.clone(),
            api_base: api_base.trim_end_matches('/').to_string(),
            bot,
            history_limit: config.history_limit.clamp(1, HISTORY_PAGE_MAX),
        })
    }
}

async fn rejected(response: Response) -> PublishError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    PublishError::Rejected { status, message }
}

#[async_trait]
impl PublishTarget for DiscordPublisher {
    async fn publish(&self, item: &ContentItem) -> Result<PublishedRef, PublishError> {
        let payload = WebhookPayload::for_item(item);
        let response = self
            .client
            .post(&self.webhook_url)
            .query(&[("wait", "true")])
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let message_id = response
            .json::<CreatedMessage>()
            .await
            .ok()
            .map(|m| m.id);

        Ok(PublishedRef {
            target: "discord".to_string(),
            message_id,
        })
    }

    async fn recent_fingerprints(&self) -> Result<Vec<(String, ContentKind)>, PublishError> {
        let (token, channel_id) = self
            .bot
            .as_ref()
            .ok_or(PublishError::Unconfigured("bot_token/channel_id"))?;

        let url = format!("{}/channels/{}/messages", self.api_base, channel_id);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bot {}", token))
            .query(&[("limit", self.history_limit)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let messages: Vec<HistoryMessage> = response.json().await?;
        let mut found = Vec::new();
        for message in &messages {
            let embed_urls = message.embeds.iter().filter_map(|e| e.url.as_deref());
            for url in embed_urls.chain(extract_urls(&message.content)) {
                if let Some(entry) = fingerprint_for_url(url) {
                    if !found.contains(&entry) {
                        found.push(entry);
                    }
                }
            }
        }

        tracing::info!(
            messages = messages.len(),
            fingerprints = found.len(),
            "Scanned publish channel history"
        );
        Ok(found)
    }

    fn name(&self) -> &str {
        "discord"
    }
}
