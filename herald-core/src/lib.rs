pub mod client;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod models;
pub mod retry;
pub mod sessions;
pub mod upstream;

pub use client::{
    ChatReply, ClientError, IngestAck, ReplyStatus, ResponseStream, ServiceClient, Upstream,
    DEGRADED_REPLY_TEXT, EMPTY_REPLY_TEXT,
};
pub use config::HeraldConfig;
pub use dedup::DedupStore;
pub use error::HeraldError;
pub use retry::{ErrorClass, RetryPolicy};
pub use sessions::{SessionError, SessionRegistry};
pub use upstream::HttpUpstream;
