//! Remote drive integration
//!
//! This module provides:
//! - The `DriveApi` trait the engine talks to
//! - An HTTP client for the Microsoft Graph drive endpoints
//! - An in-memory drive for tests and offline use
//!
//! Paths are slash-separated and relative to the drive root
//! (e.g. `drivesync/users.json`).

mod client;
mod memory;

pub use client::GraphDriveClient;
pub use memory::{DriveCall, InMemoryDrive};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors from the remote drive
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriveError {
    /// 401/403: token missing, expired or lacking permission
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 404: the item does not exist
    #[error("Item not found: {0}")]
    NotFound(String),

    /// The remote could not be reached
    #[error("Connection failed: {0}")]
    Connectivity(String),

    /// Any other HTTP failure status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),
}

/// Metadata for a file or folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub is_folder: bool,
    /// Short-lived pre-authenticated download URL (files only)
    pub download_url: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Operations the engine needs from the remote drive
pub trait DriveApi: Send + Sync {
    /// Whether a folder exists at `path`
    fn folder_exists(&self, path: &str) -> Result<bool, DriveError>;

    /// Create folder `name` under `parent` ("" is the drive root)
    fn create_folder(&self, parent: &str, name: &str) -> Result<DriveItem, DriveError>;

    /// Read a file's content
    fn read_file(&self, path: &str) -> Result<Vec<u8>, DriveError>;

    /// Create or fully replace a file
    fn write_file(&self, path: &str, content: &[u8]) -> Result<DriveItem, DriveError>;

    /// List the direct children of a folder
    fn list_children(&self, path: &str) -> Result<Vec<DriveItem>, DriveError>;

    /// Fetch item metadata, including a download URL for files
    fn get_item_metadata(&self, path: &str) -> Result<DriveItem, DriveError>;
}

/// Supplies the bearer token for drive requests
pub trait TokenSource: Send + Sync {
    fn bearer_token(&self) -> Result<String, DriveError>;
}

/// Join path segments, dropping empty ones
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_matches('/');
    let name = name.trim_matches('/');
    match (parent.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => parent.to_string(),
        (false, false) => format!("{}/{}", parent, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "app"), "app");
        assert_eq!(join_path("app", "users.json"), "app/users.json");
        assert_eq!(join_path("/app/", "/attachments/"), "app/attachments");
        assert_eq!(join_path("app", ""), "app");
    }
}
