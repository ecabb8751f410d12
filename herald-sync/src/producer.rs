use anyhow::Result;
use async_trait::async_trait;
use herald_core::models::{ContentItem, ContentKind};

/// A read-only source of content items.
///
/// Implementations must return the same fingerprint for the same underlying
/// content on every call; the scheduler's dedup relies on it.
#[async_trait]
pub trait ContentProducer: Send + Sync {
    async fn fetch(&self) -> Result<Vec<ContentItem>>;

    fn kind(&self) -> ContentKind;

    /// Producer name for logging.
    fn name(&self) -> &str;
}
