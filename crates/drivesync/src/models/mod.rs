//! Domain models for the sync engine

mod attachment;
mod record;
mod session;
mod snapshot;
mod sync_state;

pub use attachment::AttachmentRef;
pub use record::Versioned;
pub use session::{Session, UserInfo};
pub use snapshot::{ExportManifest, ImportedTable, TableSnapshot};
pub use sync_state::{ExportSummary, SyncState, SyncStatus};
