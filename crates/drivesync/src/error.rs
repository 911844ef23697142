//! Error taxonomy for the sync engine

use thiserror::Error;

use crate::auth::AuthError;
use crate::drive::DriveError;

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by engine operations
///
/// `Auth` is the "needs reconnect" condition: callers flip the authenticated
/// flag to false when they see it. `NotFound` is only surfaced where an absent
/// remote resource is an actual failure; per-table imports treat it as an
/// empty table.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote store unreachable
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Missing, expired or insufficient credentials
    #[error("Authentication required: {0}")]
    Auth(String),

    /// Expected remote resource is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote payload has the wrong shape
    #[error("Invalid data: {0}")]
    Validation(String),

    /// The credential layer could not start in this environment
    #[error("Sync unavailable: {0}")]
    Unavailable(String),

    /// Local collection or key-value store failure
    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    /// JSON encoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether this error means the session must be re-established
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

impl From<DriveError> for SyncError {
    fn from(e: DriveError) -> Self {
        match e {
            DriveError::Unauthorized(msg) => SyncError::Auth(msg),
            DriveError::NotFound(path) => SyncError::NotFound(path),
            DriveError::Connectivity(msg) => SyncError::Connectivity(msg),
            DriveError::Decode(msg) => SyncError::Validation(msg),
            e @ DriveError::Http { .. } => SyncError::Connectivity(e.to_string()),
        }
    }
}

impl From<AuthError> for SyncError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unavailable(msg) => SyncError::Unavailable(msg),
            AuthError::Network(msg) => SyncError::Connectivity(msg),
            other => SyncError::Auth(other.to_string()),
        }
    }
}
