use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::content::ContentKind;

/// Durable proof that a fingerprint was already published. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub fingerprint: String,
    pub kind: ContentKind,
    pub first_seen_at: DateTime<Utc>,
}

/// A seen item whose knowledge base upload has not succeeded yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIngest {
    pub fingerprint: String,
    pub kind: ContentKind,
    pub link: String,
    pub queued_at: DateTime<Utc>,
    /// Failed retries since it was queued.
    pub attempts: u32,
}
