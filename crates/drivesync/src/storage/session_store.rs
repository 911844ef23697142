//! Durable session and sync-time records
//!
//! Three entries live in the key-value store:
//! - the credential session (account + token), owned by the credential manager
//! - the primary sync record `{isAuthenticated, userInfo, lastSyncTime, timestamp}`
//! - a backup holding only the last successful sync time
//!
//! Both timestamped records expire after the configured TTL and are removed
//! when a load finds them expired or unreadable.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::traits::KeyValueStore;
use crate::models::{Session, UserInfo};

/// Key names used in the key-value store
pub mod keys {
    pub const CREDENTIAL_SESSION: &str = "drivesync.credential_session";
    pub const SYNC_SESSION: &str = "drivesync.sync_session";
    pub const LAST_SYNC_BACKUP: &str = "drivesync.last_sync_time";
}

/// Primary persisted sync record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub is_authenticated: bool,
    pub user_info: Option<UserInfo>,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    /// When the record was written; the TTL counts from here
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCredential {
    #[serde(flatten)]
    session: Session,
    timestamp: DateTime<Utc>,
}

/// Typed access to the persisted session entries
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: chrono::Duration,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: std::time::Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self { kv, ttl }
    }

    fn is_expired(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - timestamp >= self.ttl
    }

    // === Credential session ===

    /// Persist the credential session, stamped now
    pub fn save_credentials(&self, session: &Session) -> Result<()> {
        let stored = StoredCredential {
            session: session.clone(),
            timestamp: Utc::now(),
        };
        self.kv
            .set(keys::CREDENTIAL_SESSION, &serde_json::to_string(&stored)?)
    }

    /// Load the credential session if it is younger than the TTL
    pub fn load_credentials(&self) -> Result<Option<Session>> {
        self.load_credentials_at(Utc::now())
    }

    pub fn load_credentials_at(&self, now: DateTime<Utc>) -> Result<Option<Session>> {
        let Some(raw) = self.kv.get(keys::CREDENTIAL_SESSION)? else {
            return Ok(None);
        };

        match serde_json::from_str::<StoredCredential>(&raw) {
            Ok(stored) if !self.is_expired(stored.timestamp, now) => Ok(Some(stored.session)),
            Ok(_) => {
                debug!("[SESSION] Persisted credential session expired, discarding");
                self.clear_credentials()?;
                Ok(None)
            }
            Err(e) => {
                warn!("[SESSION] Discarding unreadable credential session: {}", e);
                self.clear_credentials()?;
                Ok(None)
            }
        }
    }

    pub fn clear_credentials(&self) -> Result<()> {
        self.kv.remove(keys::CREDENTIAL_SESSION)
    }

    // === Sync record ===

    /// Persist the primary sync record, stamped now
    ///
    /// A known sync time is mirrored into the backup entry.
    pub fn save_sync_record(
        &self,
        is_authenticated: bool,
        user_info: Option<UserInfo>,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Result<SyncRecord> {
        let record = SyncRecord {
            is_authenticated,
            user_info,
            last_sync_time,
            timestamp: Utc::now(),
        };
        self.kv
            .set(keys::SYNC_SESSION, &serde_json::to_string(&record)?)?;
        if let Some(time) = last_sync_time {
            self.save_backup_sync_time(time)?;
        }
        Ok(record)
    }

    /// Record a successful sync in both the primary record and the backup
    pub fn record_sync_time(&self, time: DateTime<Utc>) -> Result<()> {
        self.save_backup_sync_time(time)?;
        if let Some(record) = self.load_sync_record()? {
            self.save_sync_record(record.is_authenticated, record.user_info, Some(time))?;
        }
        Ok(())
    }

    /// Load the primary sync record if it is younger than the TTL
    pub fn load_sync_record(&self) -> Result<Option<SyncRecord>> {
        self.load_sync_record_at(Utc::now())
    }

    /// Load the primary sync record as of `now`
    ///
    /// A null `lastSyncTime` is repaired from the backup entry.
    pub fn load_sync_record_at(&self, now: DateTime<Utc>) -> Result<Option<SyncRecord>> {
        let Some(raw) = self.kv.get(keys::SYNC_SESSION)? else {
            return Ok(None);
        };

        let mut record = match serde_json::from_str::<SyncRecord>(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("[SESSION] Discarding unreadable sync record: {}", e);
                self.clear_sync_record()?;
                return Ok(None);
            }
        };

        if self.is_expired(record.timestamp, now) {
            debug!("[SESSION] Persisted sync record expired, discarding");
            self.clear_sync_record()?;
            return Ok(None);
        }

        if record.last_sync_time.is_none() {
            record.last_sync_time = self.backup_sync_time()?;
        }

        Ok(Some(record))
    }

    pub fn clear_sync_record(&self) -> Result<()> {
        self.kv.remove(keys::SYNC_SESSION)
    }

    // === Backup sync time ===

    fn save_backup_sync_time(&self, time: DateTime<Utc>) -> Result<()> {
        self.kv.set(keys::LAST_SYNC_BACKUP, &time.to_rfc3339())
    }

    /// Last successful sync time from the backup entry
    pub fn backup_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .kv
            .get(keys::LAST_SYNC_BACKUP)?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}
