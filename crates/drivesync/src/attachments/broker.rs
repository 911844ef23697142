//! Attachment URL resolution
//!
//! Resolving an attachment costs a metadata request, so resolved URLs are
//! cached for a short TTL, concurrent requests for the same file share one
//! lookup, and at most a fixed number of lookups run at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use moka::sync::Cache;

use crate::config::EngineConfig;
use crate::drive::{DriveApi, DriveError, join_path};
use crate::error::SyncError;
use crate::models::AttachmentRef;
use crate::runtime::{BackgroundTask, Semaphore, lock};
use crate::sync::{StateStore, StoreAction};

/// Attachment resolution failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The attachment does not exist remotely
    #[error("Attachment not found: {0}")]
    NotFound(String),

    /// The session is no longer accepted; reconnect required
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Any other failure
    #[error("Failed to resolve attachment: {0}")]
    Resolution(String),
}

impl From<BrokerError> for SyncError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::NotFound(name) => SyncError::NotFound(name),
            BrokerError::AuthExpired(msg) => SyncError::Auth(msg),
            BrokerError::Resolution(msg) => SyncError::Connectivity(msg),
        }
    }
}

struct BrokerInner {
    drive: Arc<dyn DriveApi>,
    state: Arc<StateStore>,
    folder: String,
    sweep_interval: Duration,
    /// fileName -> download URL, expired after the configured TTL
    urls: Cache<String, String>,
    permits: Semaphore,
    sweeper: Mutex<Option<BackgroundTask>>,
    lookups: AtomicUsize,
}

impl BrokerInner {
    fn lookup(&self, file_name: &str) -> Result<String, BrokerError> {
        let _permit = self.permits.acquire();
        self.lookups.fetch_add(1, Ordering::Relaxed);

        let path = join_path(&self.folder, file_name);
        let item = match self.drive.get_item_metadata(&path) {
            Ok(item) => item,
            Err(DriveError::Unauthorized(msg)) => {
                warn!("[BROKER] Session rejected while resolving {}", file_name);
                self.state.dispatch(StoreAction::AuthExpired {
                    message: "Your session has expired. Reconnect to load attachments.".to_string(),
                });
                return Err(BrokerError::AuthExpired(msg));
            }
            Err(DriveError::NotFound(_)) => return Err(BrokerError::NotFound(file_name.to_string())),
            Err(e) => return Err(BrokerError::Resolution(e.to_string())),
        };

        let url = item
            .download_url
            .ok_or_else(|| BrokerError::Resolution(format!("No download URL for {}", file_name)))?;

        debug!("[BROKER] Resolved {}", file_name);
        Ok(url)
    }

    fn sweep(&self) {
        self.urls.run_pending_tasks();
    }
}

/// Resolves attachments to download URLs with caching and admission control
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct ResourceBroker {
    inner: Arc<BrokerInner>,
}

impl ResourceBroker {
    pub fn new(drive: Arc<dyn DriveApi>, state: Arc<StateStore>, config: &EngineConfig) -> Self {
        let urls = Cache::builder().time_to_live(config.url_cache_ttl).build();

        Self {
            inner: Arc::new(BrokerInner {
                drive,
                state,
                folder: config.attachments_path(),
                sweep_interval: config.url_cache_sweep,
                urls,
                permits: Semaphore::new(config.max_concurrent_resolutions),
                sweeper: Mutex::new(None),
                lookups: AtomicUsize::new(0),
            }),
        }
    }

    /// Resolve an attachment to a short-lived download URL
    ///
    /// Served from the cache while fresh. Callers asking for the same file
    /// while a lookup is in flight receive that lookup's result. Failures are
    /// not cached.
    pub fn resolve_attachment_url(&self, file_name: &str) -> Result<String, BrokerError> {
        let inner = &self.inner;
        inner
            .urls
            .try_get_with(file_name.to_string(), || inner.lookup(file_name))
            .map_err(|e| (*e).clone())
    }

/// Upload attachment content under the reference's file name
    pub fn upload_attachment(&self, attachment: &AttachmentRef, content: &[u8]) -> Result<(), BrokerError> {
        let path = join_path(&self.inner.folder, &attachment.file_name);
        self.inner.drive.write_file(&path, content).map_err(|e| match e {
            DriveError::Unauthorized(msg) => {
                self.inner.state.dispatch(StoreAction::AuthExpired {
                    message: "Your session has expired. Reconnect to upload attachments.".to_string(),
                });
                BrokerError::AuthExpired(msg)
            }
            other => BrokerError::Resolution(other.to_string()),
        })?;

        self.invalidate(&attachment.file_name);
        info!("[BROKER] Uploaded {} ({} bytes)", attachment.file_name, content.len());
        Ok(())
    }

    /// Name and upload a new attachment for a record
    pub fn attach(
        &self,
        record_type: &str,
        record_id: &str,
        original_file_name: &str,
        content: &[u8],
    ) -> Result<AttachmentRef, BrokerError> {
        let attachment = AttachmentRef::new(
            record_type,
            record_id,
            Utc::now().timestamp_millis(),
            original_file_name,
        );
        self.upload_attachment(&attachment, content)?;
        Ok(attachment)
    }

    /// Drop the cached URL for one file
    pub fn invalidate(&self, file_name: &str) {
        self.inner.urls.invalidate(file_name);
    }

    pub fn clear_cache(&self) {
        self.inner.urls.invalidate_all();
        self.inner.sweep();
    }

    /// Evict expired cache entries now instead of on the next sweep
    pub fn sweep_expired(&self) {
        self.inner.sweep();
        debug!("[BROKER] {} URLs cached after sweep", self.inner.urls.entry_count());
    }

    /// Start the periodic cache sweep (no-op if already running)
    pub fn start_sweeper(&self) {
        let mut sweeper = lock(&self.inner.sweeper);
        if sweeper.is_some() {
            return;
        }

        let weak: Weak<BrokerInner> = Arc::downgrade(&self.inner);
        *sweeper = Some(BackgroundTask::every(
            "url-cache-sweep",
            self.inner.sweep_interval,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.sweep();
                }
            },
        ));
    }

    pub fn stop_sweeper(&self) {
        if let Some(mut task) = lock(&self.inner.sweeper).take() {
            task.cancel();
        }
    }

    pub fn is_sweeping(&self) -> bool {
        lock(&self.inner.sweeper).is_some()
    }

    /// Number of cached URLs once pending evictions have been applied
    pub fn cache_len(&self) -> usize {
        self.inner.sweep();
        self.inner.urls.entry_count() as usize
    }

    /// Metadata lookups issued so far
    pub fn lookup_count(&self) -> usize {
        self.inner.lookups.load(Ordering::Relaxed)
    }

    /// Lookups currently holding a permit
    pub fn active_lookups(&self) -> usize {
        self.inner.permits.active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{DriveCall, InMemoryDrive};
    use crate::models::SyncState;
    use std::sync::Barrier;

    fn setup(drive: InMemoryDrive, config: EngineConfig) -> (ResourceBroker, Arc<InMemoryDrive>, Arc<StateStore>) {
        let drive = Arc::new(drive);
        let state = Arc::new(StateStore::with_state(SyncState {
            is_authenticated: true,
            ..SyncState::default()
        }));
        let broker = ResourceBroker::new(drive.clone(), state.clone(), &config);
        (broker, drive, state)
    }

    #[test]
    fn test_resolution_is_cached() {
        let (broker, drive, _state) = setup(InMemoryDrive::new(), EngineConfig::default());
        drive.insert_file("drivesync/attachments/note_n1_1_a.png", b"png".to_vec());

        let first = broker.resolve_attachment_url("note_n1_1_a.png").unwrap();
        let second = broker.resolve_attachment_url("note_n1_1_a.png").unwrap();
        assert_eq!(first, second);
        assert_eq!(drive.call_count(DriveCall::GetItemMetadata), 1);
        assert_eq!(broker.cache_len(), 1);
    }

    #[test]
    fn test_concurrent_requests_share_one_lookup() {
        let drive = InMemoryDrive::new().with_latency(Duration::from_millis(100));
        let (broker, drive, _state) = setup(drive, EngineConfig::default());
        drive.insert_file("drivesync/attachments/note_n1_1_a.png", b"png".to_vec());

        let barrier = Barrier::new(8);
        let urls: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        broker.resolve_attachment_url("note_n1_1_a.png").unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(urls.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(drive.call_count(DriveCall::GetItemMetadata), 1);
        assert_eq!(broker.lookup_count(), 1);
    }

    #[test]
    fn test_lookups_are_capped() {
        let drive = InMemoryDrive::new().with_latency(Duration::from_millis(100));
        let (broker, drive, _state) = setup(drive, EngineConfig::default());
        for i in 0..6 {
            drive.insert_file(&format!("drivesync/attachments/note_n{}_1_a.png", i), b"png".to_vec());
        }

        let peak = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for i in 0..6 {
                let broker = &broker;
                s.spawn(move || broker.resolve_attachment_url(&format!("note_n{}_1_a.png", i)).unwrap());
            }
            s.spawn(|| {
                for _ in 0..20 {
                    peak.fetch_max(broker.active_lookups(), Ordering::Relaxed);
                    std::thread::sleep(Duration::from_millis(10));
                }
            });
        });

        assert!(peak.load(Ordering::Relaxed) <= 3);
        assert_eq!(broker.lookup_count(), 6);
    }

    #[test]
    fn test_unauthorized_flips_authentication() {
        let (broker, drive, state) = setup(InMemoryDrive::new(), EngineConfig::default());
        drive.fail_always(
            DriveCall::GetItemMetadata,
            DriveError::Unauthorized("expired".to_string()),
        );

        let err = broker.resolve_attachment_url("note_n1_1_a.png").unwrap_err();
        assert!(matches!(err, BrokerError::AuthExpired(_)));

        let snapshot = state.snapshot();
        assert!(!snapshot.is_authenticated);
        assert!(snapshot.error.is_some());
    }

    #[test]
    fn test_missing_attachment_is_not_found() {
        let (broker, _drive, state) = setup(InMemoryDrive::new(), EngineConfig::default());
        assert_eq!(
            broker.resolve_attachment_url("note_n1_1_missing.png"),
            Err(BrokerError::NotFound("note_n1_1_missing.png".to_string()))
        );
        assert!(state.snapshot().is_authenticated);
    }

    #[test]
    fn test_expired_entries_are_refetched_and_swept() {
        let config = EngineConfig::default().with_url_cache_ttl(Duration::from_millis(50));
        let (broker, drive, _state) = setup(InMemoryDrive::new(), config);
        drive.insert_file("drivesync/attachments/note_n1_1_a.png", b"png".to_vec());

        broker.resolve_attachment_url("note_n1_1_a.png").unwrap();
        assert_eq!(broker.cache_len(), 1);
        std::thread::sleep(Duration::from_millis(80));

        broker.sweep_expired();
        assert_eq!(broker.cache_len(), 0);

        broker.resolve_attachment_url("note_n1_1_a.png").unwrap();
        assert_eq!(drive.call_count(DriveCall::GetItemMetadata), 2);
    }

    #[test]
    fn test_upload_invalidates_cached_url() {
        let (broker, drive, _state) = setup(InMemoryDrive::new(), EngineConfig::default());
        let attachment = broker.attach("note", "n1", "scan.pdf", b"v1").unwrap();
        let first = broker.resolve_attachment_url(&attachment.file_name).unwrap();

        broker.upload_attachment(&attachment, b"v2").unwrap();
        assert_eq!(broker.cache_len(), 0);

        let second = broker.resolve_attachment_url(&attachment.file_name).unwrap();
        assert_ne!(first, second);
        assert_eq!(
            drive.file(&format!("drivesync/attachments/{}", attachment.file_name)),
            Some(b"v2".to_vec())
        );
    }

    #[test]
    fn test_failures_are_not_cached() {
        let (broker, drive, _state) = setup(InMemoryDrive::new(), EngineConfig::default());
        drive.fail_times(
            DriveCall::GetItemMetadata,
            1,
            DriveError::Connectivity("timed out".to_string()),
        );
        drive.insert_file("drivesync/attachments/note_n1_1_a.png", b"png".to_vec());

        assert!(matches!(
            broker.resolve_attachment_url("note_n1_1_a.png"),
            Err(BrokerError::Resolution(_))
        ));
        assert_eq!(broker.cache_len(), 0);
        assert!(broker.resolve_attachment_url("note_n1_1_a.png").is_ok());
        assert_eq!(broker.lookup_count(), 2);
    }

    #[test]
    fn test_concurrent_failures_share_one_lookup() {
        let drive = InMemoryDrive::new().with_latency(Duration::from_millis(100));
        let (broker, drive, _state) = setup(drive, EngineConfig::default());

        let barrier = Barrier::new(4);
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        broker.resolve_attachment_url("note_n1_1_missing.png")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results
            .iter()
            .all(|r| *r == Err(BrokerError::NotFound("note_n1_1_missing.png".to_string()))));
        assert_eq!(drive.call_count(DriveCall::GetItemMetadata), 1);
    }

    #[test]
    fn test_sweeper_start_stop() {
        let (broker, _drive, _state) = setup(InMemoryDrive::new(), EngineConfig::default());
        broker.start_sweeper();
        broker.start_sweeper();
        assert!(broker.is_sweeping());
        broker.stop_sweeper();
        assert!(!broker.is_sweeping());
    }
}
