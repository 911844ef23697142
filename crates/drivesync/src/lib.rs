//! Drivesync - Local-first table sync against a remote drive
//!
//! This crate keeps a local collection store (named tables of small JSON
//! records) synchronized with a folder in the user's remote drive:
//! - Credential session lifecycle (OAuth sign-in, silent renewal, persistence)
//! - Per-table export/import of full table snapshots
//! - Last-write-wins record merge on import
//! - Cached, de-duplicated and throttled attachment URL resolution
//! - A sync orchestrator publishing one observable state
//!
//! The API is blocking and thread-safe; HTTP is synchronous (ureq) so the
//! crate stays executor-agnostic.

pub mod attachments;
pub mod auth;
pub mod config;
pub mod drive;
pub mod error;
pub mod models;
pub mod runtime;
pub mod storage;
pub mod sync;

pub use attachments::{BrokerError, ResourceBroker};
pub use auth::{
    AuthAccount, AuthError, AuthToken, CredentialManager, CredentialProvider, OAuthProvider,
    ScriptedProvider,
};
pub use crate::config::{DriveCredentials, EngineConfig};
pub use drive::{DriveApi, DriveError, DriveItem, GraphDriveClient, InMemoryDrive, TokenSource};
pub use error::{SyncError, SyncResult};
pub use models::{
    AttachmentRef, ExportManifest, ExportSummary, ImportedTable, Session, SyncState, SyncStatus,
    TableSnapshot, UserInfo, Versioned,
};
pub use runtime::{BackgroundTask, Coalescer, RetryPolicy, Semaphore};
pub use storage::{
    CollectionStore, FileKeyValueStore, InMemoryCollectionStore, InMemoryKeyValueStore,
    KeyValueStore, SessionStore, SqliteCollectionStore,
};
pub use sync::{
    // Actions and state
    StateStore, StoreAction, SyncOrchestrator, SyncAllSummary, TableSync,
    // Transfers
    ImportBatch, PullSummary, TableExport, TablePull, TableTransfer,
    // Merge
    MergeReport, merge, merge_with_report,
};
