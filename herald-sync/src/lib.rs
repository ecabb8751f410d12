pub mod backfill;
pub mod discord;
pub mod fingerprint;
pub mod producer;
pub mod producers;
pub mod publisher;
pub mod scheduler;

pub use backfill::{run_backfill, BackfillReport};
pub use discord::DiscordPublisher;
pub use producer::ContentProducer;
pub use producers::{RssProducer, YouTubeProducer};
pub use publisher::{PublishError, PublishTarget, PublishedRef};
pub use scheduler::{
    ContentSyncScheduler, IntervalBand, ReconcileReport, ScheduleState, StreamSpec, StreamStatus,
    SyncPhase, SyncSettings, TickReport,
};
