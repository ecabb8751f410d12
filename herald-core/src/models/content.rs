use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Article,
    Video,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Article => "article",
            ContentKind::Video => "video",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "article" => Ok(ContentKind::Article),
            "video" => Ok(ContentKind::Video),
            other => Err(format!("unknown content kind '{}'", other)),
        }
    }
}

/// Title/body/link of a content item. Producers fill in what their source has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPayload {
    pub title: String,
    pub body: Option<String>,
    pub link: String,
    pub thumbnail_url: Option<String>,
    pub author: Option<String>,
    /// Backend-written summary, added just before publishing.
    #[serde(default)]
    pub summary: Option<String>,
}

/// A unit of external content. Immutable once a producer hands it over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Stable identity across repeated fetches (`video:<id>`, `article:<normalized url>`).
    pub fingerprint: String,
    pub kind: ContentKind,
    pub source_name: String,
    pub published_at: Option<DateTime<Utc>>,
    pub payload: ContentPayload,
}

impl ContentItem {
    pub fn link(&self) -> &str {
        &self.payload.link
    }
}
