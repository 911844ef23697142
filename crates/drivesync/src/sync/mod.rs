//! Sync engine
//!
//! - `merge`: last-write-wins record merge
//! - `tables`: table export/import against the remote drive
//! - `store`: the observable state store
//! - `orchestrator`: the action surface tying it together

mod merge;
mod orchestrator;
mod store;
mod tables;

pub use merge::{MergeReport, is_newer, merge, merge_with_report};
pub use orchestrator::{SyncAllSummary, SyncOrchestrator, TableSync};
pub use store::{StateStore, StoreAction, SubscriptionId, reduce};
pub use tables::{ImportBatch, NO_DATA_FILES, PullSummary, TableExport, TablePull, TableTransfer};
