use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque handle to a stateful conversation on the upstream backend.
///
/// The id is whatever the backend hands out; nothing here interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Stored user -> session mapping, as kept by the session registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub session: Session,
    pub last_used_at: DateTime<Utc>,
    pub message_count: i64,
}
