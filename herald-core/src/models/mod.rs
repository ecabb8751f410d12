pub mod content;
pub mod seen;
pub mod session;

pub use content::{ContentItem, ContentKind, ContentPayload};
pub use seen::{PendingIngest, SeenRecord};
pub use session::{Session, SessionInfo};
