//! Configuration loading for the sync engine
//!
//! OAuth client settings are loaded from (in order of priority):
//! 1. Compile-time embedded settings (for production builds)
//! 2. JSON file in the drivesync config directory
//! 3. Runtime environment variables (fallback)
//!
//! Engine tunables live in [`EngineConfig`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runtime::RetryPolicy;

/// Credentials filename in the drivesync config directory
const CREDENTIALS_FILE: &str = "drive-credentials.json";

/// Tenant used when none is configured (personal and work accounts)
const DEFAULT_TENANT: &str = "common";

/// OAuth client settings for the drive identity provider
#[derive(Debug, Clone)]
pub struct DriveCredentials {
    pub client_id: String,
    pub tenant: String,
}

/// Credential file format
#[derive(Deserialize)]
struct CredentialFile {
    client_id: String,
    tenant: Option<String>,
}

impl DriveCredentials {
    /// Load credentials using the following priority:
    /// 1. Compile-time embedded credentials
    /// 2. JSON file (~/.config/drivesync/drive-credentials.json)
    /// 3. Runtime environment variables
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let file: CredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Ok(Self::from_credential_file(file));
        }

        Self::from_env()
    }

    /// Load credentials embedded at compile time.
    /// Build with: DRIVESYNC_CLIENT_ID=xxx cargo build --release
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("DRIVESYNC_CLIENT_ID")?;
        if client_id.is_empty() {
            return None;
        }

        let tenant = option_env!("DRIVESYNC_TENANT")
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TENANT);

        Some(Self {
            client_id: client_id.to_string(),
            tenant: tenant.to_string(),
        })
    }

    /// Load credentials from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let file: CredentialFile = config::load_json_file(path)?;
        Ok(Self::from_credential_file(file))
    }

    /// Parse credentials from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let file: CredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Ok(Self::from_credential_file(file))
    }

    fn from_credential_file(file: CredentialFile) -> Self {
        Self {
            client_id: file.client_id,
            tenant: file
                .tenant
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_TENANT.to_string()),
        }
    }

    /// Load credentials from environment variables
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("DRIVESYNC_CLIENT_ID")
            .context("DRIVESYNC_CLIENT_ID environment variable not set")?;
        let tenant = std::env::var("DRIVESYNC_TENANT").unwrap_or_else(|_| DEFAULT_TENANT.into());

        Ok(Self { client_id, tenant })
    }

    /// Get the default credentials file path
    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }
}

/// Tunables for the sync engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Remote application folder holding all exported resources
    pub app_folder: String,
    /// Sub-folder of the application folder holding attachments
    pub attachments_folder: String,
    /// Name of the manifest resource
    pub manifest_name: String,
    /// Local database name written into every table snapshot
    pub db_name: String,
    /// Application version written into the manifest
    pub app_version: String,
    /// Logical tables with their own sync action; empty means every local collection
    pub tables: Vec<String>,
    /// Lifetime of persisted session records
    pub session_ttl: Duration,
    /// How long before token expiry a renewal is scheduled
    pub renewal_margin: Duration,
    /// Retry schedule for silent token acquisition
    pub token_retry: RetryPolicy,
    /// Lifetime of a resolved attachment URL
    pub url_cache_ttl: Duration,
    /// Interval of the attachment URL cache sweep
    pub url_cache_sweep: Duration,
    /// Maximum simultaneous attachment resolutions
    pub max_concurrent_resolutions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_folder: "drivesync".to_string(),
            attachments_folder: "attachments".to_string(),
            manifest_name: "export_metadata.json".to_string(),
            db_name: "drivesync".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            tables: Vec::new(),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            renewal_margin: Duration::from_secs(5 * 60),
            token_retry: RetryPolicy::linear(3, Duration::from_millis(500)),
            url_cache_ttl: Duration::from_secs(5 * 60),
            url_cache_sweep: Duration::from_secs(2 * 60),
            max_concurrent_resolutions: 3,
        }
    }
}

impl EngineConfig {
    /// Set the remote application folder
    pub fn with_app_folder(mut self, folder: impl Into<String>) -> Self {
        self.app_folder = folder.into();
        self
    }

    /// Set the local database name
    pub fn with_db_name(mut self, name: impl Into<String>) -> Self {
        self.db_name = name.into();
        self
    }

    /// Set the logical tables
    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Set the retry schedule for silent token acquisition
    pub fn with_token_retry(mut self, retry: RetryPolicy) -> Self {
        self.token_retry = retry;
        self
    }

    /// Set the persisted session lifetime
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Set the attachment URL cache lifetime
    pub fn with_url_cache_ttl(mut self, ttl: Duration) -> Self {
        self.url_cache_ttl = ttl;
        self
    }

    /// Path of a table resource inside the application folder
    pub fn table_path(&self, table: &str) -> String {
        format!("{}/{}.json", self.app_folder, table)
    }

    /// Path of the manifest resource
    pub fn manifest_path(&self) -> String {
        format!("{}/{}", self.app_folder, self.manifest_name)
    }

    /// Path of the attachments folder
    pub fn attachments_path(&self) -> String {
        format!("{}/{}", self.app_folder, self.attachments_folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_credentials_with_tenant() {
        let json = r#"{ "client_id": "abc-123", "tenant": "consumers" }"#;
        let creds = DriveCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "abc-123");
        assert_eq!(creds.tenant, "consumers");
    }

    #[test]
    fn test_parse_credentials_default_tenant() {
        let json = r#"{ "client_id": "abc-123" }"#;
        let creds = DriveCredentials::from_json(json).unwrap();
        assert_eq!(creds.tenant, "common");
    }

    #[test]
    fn test_invalid_json() {
        assert!(DriveCredentials::from_json(r#"{ "other": {} }"#).is_err());
    }

    #[test]
    fn test_default_paths() {
        let config = EngineConfig::default().with_app_folder("app");
        assert_eq!(config.table_path("users"), "app/users.json");
        assert_eq!(config.manifest_path(), "app/export_metadata.json");
        assert_eq!(config.attachments_path(), "app/attachments");
        assert_eq!(config.max_concurrent_resolutions, 3);
        assert_eq!(config.session_ttl, Duration::from_secs(86_400));
    }
}
