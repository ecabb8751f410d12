use async_trait::async_trait;
use herald_core::models::{ContentItem, ContentKind};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Publish target rejected the message ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Publish target not configured: {0}")]
    Unconfigured(&'static str),
}

/// Where a published item ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedRef {
    pub target: String,
    pub message_id: Option<String>,
}

#[async_trait]
pub trait PublishTarget: Send + Sync {
    async fn publish(&self, item: &ContentItem) -> Result<PublishedRef, PublishError>;

    /// Fingerprints of recently published items, read back from the target.
    ///
    /// Only consulted on first run, when the durable store is empty. Bounded
    /// and lossy, so never a substitute for the store.
    async fn recent_fingerprints(&self) -> Result<Vec<(String, ContentKind)>, PublishError> {
        Err(PublishError::Unconfigured("history scan"))
    }

    fn name(&self) -> &str;
}
