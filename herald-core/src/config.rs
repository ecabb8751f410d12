use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::error::HeraldError;

/// Env var consulted when `upstream.api_token = "ENV"`.
pub const UPSTREAM_TOKEN_ENV: &str = "GPT_TRAINER_TOKEN";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct HeraldConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub chatbot_uuid: String,
    pub api_token: String,
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://app.gpt-trainer.com/api/v1".to_string(),
            chatbot_uuid: String::new(),
            api_token: String::new(),
            connect_timeout_secs: 10,
        }
    }
}

/// Concurrency gate and retry budget for the service client.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub concurrency: usize,
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
            attempt_timeout_secs: 30,
        }
    }
}

/// A `[min, max]` pair, written as a two-element array in TOML.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(from = "(f64, f64)")]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl From<(f64, f64)> for Band {
    fn from((min, max): (f64, f64)) -> Self {
        Self { min, max }
    }
}

impl Band {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    fn check(&self, field: &str, allow_zero: bool, problems: &mut Vec<String>) {
        let floor_ok = if allow_zero { self.min >= 0.0 } else { self.min > 0.0 };
        if !floor_ok || !self.min.is_finite() || !self.max.is_finite() {
            problems.push(format!(
                "{} lower bound must be {}",
                field,
                if allow_zero { ">= 0" } else { "> 0" }
            ));
        }
        if self.min > self.max {
            problems.push(format!(
                "{} lower bound {} exceeds upper bound {}",
                field, self.min, self.max
            ));
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub retention_days: u64,
    pub shutdown_timeout_secs: u64,
    pub run_on_start: bool,
    pub publish_spacing_secs: Band,
    /// Attach a backend-written summary to article posts.
    pub summarize_articles: bool,
    pub articles: ArticleStreamConfig,
    pub videos: VideoStreamConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 90,
            shutdown_timeout_secs: 30,
            run_on_start: true,
            publish_spacing_secs: Band::new(0.0, 0.0),
            summarize_articles: false,
            articles: ArticleStreamConfig::default(),
            videos: VideoStreamConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ArticleStreamConfig {
    pub interval_hours: Band,
    pub feeds: Vec<FeedSource>,
}

impl Default for ArticleStreamConfig {
    fn default() -> Self {
        Self {
            interval_hours: Band::new(2.0, 6.0),
            feeds: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelSource {
    pub name: String,
    pub channel_id: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VideoStreamConfig {
    pub interval_hours: Band,
    pub api_key: String,
    pub channels: Vec<ChannelSource>,
    pub lookback_days: u64,
    pub max_results: u32,
}

impl Default for VideoStreamConfig {
    fn default() -> Self {
        Self {
            interval_hours: Band::new(1.0, 3.0),
            api_key: String::new(),
            channels: Vec::new(),
            lookback_days: 7,
            max_results: 25,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PublishConfig {
    pub webhook_url: String,
    pub bot_token: Option<String>,
    pub channel_id: Option<String>,
    pub history_limit: u32,
    pub timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            bot_token: None,
            channel_id: None,
            history_limit: 100,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl HeraldConfig {
    /// Load from a TOML file layered with `HERALD__SECTION__KEY` env overrides,
    /// then resolve secrets and validate. Every problem found is reported at once.
    pub fn load(path: &str) -> Result<Self, HeraldError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("HERALD")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let mut cfg: HeraldConfig = s.try_deserialize()?;
        cfg.resolve_secrets();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Replace `"ENV"` placeholders with values from the process environment.
    pub fn resolve_secrets(&mut self) {
        if self.upstream.api_token.trim().eq_ignore_ascii_case("env") {
            self.upstream.api_token = std::env::var(UPSTREAM_TOKEN_ENV).unwrap_or_default();
        }
    }

    pub fn validate(&self) -> Result<(), HeraldError> {
        let mut problems = Vec::new();

        let db_url = self.database.url.trim();
        if db_url.is_empty() {
            problems.push("database.url is required".to_string());
        } else if db_url.contains(":memory:") || db_url.contains("mode=memory") {
            problems.push("database.url must point at a durable file, not an in-memory database".to_string());
        }
        if self.database.max_connections == 0 {
            problems.push("database.max_connections must be >= 1".to_string());
        }

        if self.upstream.base_url.trim().is_empty() {
            problems.push("upstream.base_url is required".to_string());
        }
        if self.upstream.chatbot_uuid.trim().is_empty() {
            problems.push("upstream.chatbot_uuid is required".to_string());
        }
        if self.upstream.api_token.trim().is_empty() {
            problems.push(format!(
                "upstream.api_token is required (or set it to \"ENV\" and export {})",
                UPSTREAM_TOKEN_ENV
            ));
        }

        if self.client.concurrency == 0 {
            problems.push("client.concurrency must be >= 1".to_string());
        }
        if self.client.max_attempts == 0 {
            problems.push("client.max_attempts must be >= 1".to_string());
        }
        if self.client.backoff_base_ms == 0 {
            problems.push("client.backoff_base_ms must be >= 1".to_string());
        }
        if self.client.backoff_base_ms > self.client.backoff_cap_ms {
            problems.push(format!(
                "client.backoff_base_ms ({}) exceeds client.backoff_cap_ms ({})",
                self.client.backoff_base_ms, self.client.backoff_cap_ms
            ));
        }
        if self.client.attempt_timeout_secs == 0 {
            problems.push("client.attempt_timeout_secs must be >= 1".to_string());
        }

        if self.sync.enabled {
            if self.sync.retention_days == 0 {
                problems.push("sync.retention_days must be >= 1".to_string());
            }
            self.sync
                .articles
                .interval_hours
                .check("sync.articles.interval_hours", false, &mut problems);
            self.sync
                .videos
                .interval_hours
                .check("sync.videos.interval_hours", false, &mut problems);
            self.sync
                .publish_spacing_secs
                .check("sync.publish_spacing_secs", true, &mut problems);
            if !self.sync.videos.channels.is_empty() && self.sync.videos.api_key.trim().is_empty() {
                problems.push("sync.videos.api_key is required when video channels are configured".to_string());
            }
            if self.publish.webhook_url.trim().is_empty() {
                problems.push("publish.webhook_url is required when sync is enabled".to_string());
            }
            if self.publish.bot_token.is_some() != self.publish.channel_id.is_some() {
                problems.push("publish.bot_token and publish.channel_id must be set together".to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(HeraldError::InvalidConfig { problems })
        }
    }
}
