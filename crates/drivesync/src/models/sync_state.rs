//! Observable sync state shared with subscribers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserInfo;

/// Progress of the most recent sync action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Success,
    Error,
}

/// Outcome of the latest export, kept for display
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    /// Tables written to the remote store
    pub tables: Vec<String>,
    /// One message per table that failed
    pub errors: Vec<String>,
    /// Manifest path, for bulk exports
    pub manifest_path: Option<String>,
}

impl ExportSummary {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The single state object observed by every subscriber
///
/// Only ever replaced through the state store's reducer, so subscribers
/// always see whole transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Whether a usable session exists
    pub is_authenticated: bool,
    /// Whether an interactive connect is in progress
    pub is_connecting: bool,
    /// Last successful sync (None if never synced)
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    /// Latest error, kept until cleared or superseded
    pub error: Option<String>,
    pub user_info: Option<UserInfo>,
    pub export_result: Option<ExportSummary>,
    /// Sync actions currently in flight
    pub active_operations: usize,
}

impl SyncState {
    /// Whether any sync action is running
    pub fn is_syncing(&self) -> bool {
        self.active_operations > 0
    }
}
