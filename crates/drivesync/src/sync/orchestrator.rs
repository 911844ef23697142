//! Sync orchestrator
//!
//! The action surface of the engine. Each action obtains credentials through
//! the credential manager, runs table transfers, and reports every step to
//! the shared state store. Actions are independent and may overlap; the store
//! keeps the status consistent while they do.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};

use super::store::{StateStore, StoreAction, SubscriptionId};
use super::tables::{NO_DATA_FILES, PullSummary, TableExport, TablePull, TableTransfer};
use crate::attachments::ResourceBroker;
use crate::auth::{CredentialManager, DEFAULT_MAX_RETRIES};
use crate::config::EngineConfig;
use crate::drive::DriveApi;
use crate::error::{SyncError, SyncResult};
use crate::models::{ExportSummary, Session, SyncState, UserInfo};
use crate::storage::{CollectionStore, SessionStore};

/// Table synchronized in both directions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSync {
    pub pull: TablePull,
    pub export: TableExport,
}

/// Result of syncing every table concurrently
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncAllSummary {
    pub synced: Vec<String>,
    pub errors: Vec<String>,
}

impl SyncAllSummary {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Value produced by a sync action plus what to record about it
struct Completion<T> {
    value: T,
    export_result: Option<ExportSummary>,
    /// Partial failure: the action ran but some items failed
    failure: Option<String>,
}

impl<T> Completion<T> {
    fn done(value: T) -> Self {
        Self {
            value,
            export_result: None,
            failure: None,
        }
    }
}

/// Drives credentials, transfers and attachments, and publishes state
pub struct SyncOrchestrator {
    credentials: CredentialManager,
    transfer: TableTransfer,
    broker: ResourceBroker,
    sessions: SessionStore,
    collections: Arc<dyn CollectionStore>,
    store: Arc<StateStore>,
    config: Arc<EngineConfig>,
}

impl SyncOrchestrator {
    pub fn new(
        credentials: CredentialManager,
        drive: Arc<dyn DriveApi>,
        collections: Arc<dyn CollectionStore>,
        sessions: SessionStore,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(StateStore::new());
        let transfer = TableTransfer::new(drive.clone(), collections.clone(), config.clone());
        let broker = ResourceBroker::new(drive, store.clone(), &config);
        broker.start_sweeper();

        Self {
            credentials,
            transfer,
            broker,
            sessions,
            collections,
            store,
            config,
        }
    }

    // === State ===

    /// Current shared state
    pub fn state(&self) -> SyncState {
        self.store.snapshot()
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        self.store.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn attachments(&self) -> &ResourceBroker {
        &self.broker
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub fn transfer(&self) -> &TableTransfer {
        &self.transfer
    }

    pub fn clear_error(&self) {
        self.store.dispatch(StoreAction::ClearError);
    }

    // === Session actions ===

    /// Rehydrate state from the persisted sync record
    pub fn restore(&self) -> SyncState {
        self.restore_at(Utc::now())
    }

    /// Rehydrate state as of `now`
    ///
    /// A record past its TTL is discarded and leaves the state signed out.
    /// The state is only authenticated when the credential manager also
    /// holds a usable session.
    pub fn restore_at(&self, now: DateTime<Utc>) -> SyncState {
        if let Err(e) = self.credentials.initialize() {
            warn!("[SYNC] Credential layer unavailable: {}", e);
        }

        let record = match self.sessions.load_sync_record_at(now) {
            Ok(record) => record,
            Err(e) => {
                warn!("[SYNC] Failed to read persisted sync record: {:#}", e);
                None
            }
        };

        let last_sync_time = match &record {
            Some(record) => record.last_sync_time,
            None => self.sessions.backup_sync_time().unwrap_or_default(),
        };

        let (is_authenticated, user_info) = match record {
            Some(record) if record.is_authenticated => match self.credentials.valid_session() {
                Some(session) => (true, Some(session.user_info())),
                None => (false, None),
            },
            _ => (false, None),
        };

        info!(
            "[SYNC] Restored state (authenticated: {}, last sync: {:?})",
            is_authenticated, last_sync_time
        );
        self.store.dispatch(StoreAction::Restored {
            is_authenticated,
            user_info,
            last_sync_time,
        })
    }

    /// Establish a session and make sure the application folder exists
    ///
    /// A session that can be renewed silently is reused; otherwise the
    /// interactive sign-in runs.
    pub fn connect(&self) -> SyncResult<UserInfo> {
        self.store.dispatch(StoreAction::ConnectStarted);

        match self.run_connect() {
            Ok((user_info, last_sync_time)) => {
                info!("[SYNC] Connected as {}", user_info.username);
                self.store.dispatch(StoreAction::Connected {
                    user_info: user_info.clone(),
                    last_sync_time,
                });
                Ok(user_info)
            }
            Err(e) => {
                error!("[SYNC] Connect failed: {}", e);
                self.store.dispatch(StoreAction::ConnectFailed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn run_connect(&self) -> SyncResult<(UserInfo, Option<DateTime<Utc>>)> {
        let session = self.obtain_session()?;
        self.transfer.ensure_app_folder()?;

        let user_info = session.user_info();
        let last_sync_time = self.last_known_sync_time();
        self.sessions
            .save_sync_record(true, Some(user_info.clone()), last_sync_time)?;
        Ok((user_info, last_sync_time))
    }

    fn obtain_session(&self) -> SyncResult<Session> {
        self.credentials.initialize()?;
        if let Some(session) = self.credentials.valid_session() {
            return Ok(session);
        }
        if let Some(session) = self.credentials.acquire_token_silently(DEFAULT_MAX_RETRIES) {
            return Ok(session);
        }
        Ok(self.credentials.login()?)
    }

    fn last_known_sync_time(&self) -> Option<DateTime<Utc>> {
        let current = self.store.snapshot().last_sync_time;
        if current.is_some() {
            return current;
        }
        match self.sessions.load_sync_record() {
            Ok(Some(record)) => record.last_sync_time,
            Ok(None) => self.sessions.backup_sync_time().unwrap_or_default(),
            Err(e) => {
                warn!("[SYNC] Failed to read persisted sync record: {:#}", e);
                None
            }
        }
    }

    /// Sign out and forget the session
    pub fn disconnect(&self) -> SyncResult<()> {
        let logout = self.credentials.logout();
        if let Err(e) = self.sessions.clear_sync_record() {
            warn!("[SYNC] Failed to remove persisted sync record: {:#}", e);
        }
        self.broker.clear_cache();
        self.store.dispatch(StoreAction::Disconnected);
        info!("[SYNC] Disconnected");

        logout.map_err(SyncError::from)
    }

    /// Check the session without prompting
    ///
    /// Only the authenticated flag and user info change; the last sync time
    /// is never touched.
    pub fn check_connection(&self) -> bool {
        let session = self.credentials.acquire_token_silently(DEFAULT_MAX_RETRIES);
        let authenticated = session.is_some();

        if let Some(session) = &session
            && let Err(e) = self
                .sessions
                .save_sync_record(true, Some(session.user_info()), self.last_known_sync_time())
        {
            warn!("[SYNC] Failed to persist sync record: {:#}", e);
        }

        self.store.dispatch(StoreAction::ConnectionChecked {
            authenticated,
            user_info: session.map(|s| s.user_info()),
        });
        authenticated
    }

    // === Sync actions ===

    /// Pull every remote table into the local store, then export everything
    pub fn start_sync(&self, user_id: &str) -> SyncResult<ExportSummary> {
        self.run_sync("sync", || {
            let pulled = self.transfer.pull_all_tables(user_id)?;
            // First sync: nothing remote yet is not a failure.
            let pull_errors: Vec<String> = pulled
                .errors
                .into_iter()
                .filter(|e| e != NO_DATA_FILES)
                .collect();

            let mut summary = self.transfer.export_all_tables(user_id)?;
            summary.errors.extend(pull_errors);
            Ok(export_completion(summary))
        })
    }

    /// Export every local table and the manifest
    pub fn export_data(&self, user_id: &str) -> SyncResult<ExportSummary> {
        self.run_sync("export", || {
            let summary = self.transfer.export_all_tables(user_id)?;
            Ok(export_completion(summary))
        })
    }

    /// Export one local table
    pub fn export_table(&self, table: &str, user_id: &str) -> SyncResult<TableExport> {
        self.run_sync("export", || {
            let export = self.transfer.export_table(table, user_id)?;
            Ok(Completion {
                export_result: Some(ExportSummary {
                    tables: vec![export.table.clone()],
                    errors: Vec::new(),
                    manifest_path: None,
                }),
                value: export,
                failure: None,
            })
        })
    }

    /// Pull the `users` table
    pub fn import_users(&self) -> SyncResult<TablePull> {
        self.import_table("users")
    }

    /// Pull one remote table into the local store
    pub fn import_table(&self, table: &str) -> SyncResult<TablePull> {
        self.run_sync("import", || Ok(Completion::done(self.transfer.pull_table(table)?)))
    }

    /// Pull every remote table into the local store
    pub fn import_data(&self, user_id: &str) -> SyncResult<PullSummary> {
        self.run_sync("import", || {
            let summary = self.transfer.pull_all_tables(user_id)?;
            let failure = (!summary.is_success()).then(|| {
                if summary.errors.is_empty() {
                    "No tables imported".to_string()
                } else {
                    summary.errors.join("; ")
                }
            });
            Ok(Completion {
                value: summary,
                export_result: None,
                failure,
            })
        })
    }

    /// Pull one table, merge it, then push the merged table back
    pub fn sync_table(&self, table: &str, user_id: &str) -> SyncResult<TableSync> {
        self.run_sync("sync", || {
            let pull = self.transfer.pull_table(table)?;
            let export = self.transfer.export_table(table, user_id)?;
            Ok(Completion::done(TableSync { pull, export }))
        })
    }

    /// Sync every logical table, each as its own concurrent action
    pub fn sync_all_tables(&self, user_id: &str) -> SyncResult<SyncAllSummary> {
        let tables = self.logical_tables()?;
        info!("[SYNC] Syncing {} tables", tables.len());

        let results: Vec<(String, SyncResult<TableSync>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = tables
                .iter()
                .map(|table| {
                    let handle = scope.spawn(move || self.sync_table(table, user_id));
                    (table.clone(), handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(table, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(SyncError::Validation(format!("Sync of {} panicked", table)))
                    });
                    (table, result)
                })
                .collect()
        });

        let mut summary = SyncAllSummary::default();
        for (table, result) in results {
            match result {
                Ok(_) => summary.synced.push(table),
                Err(e) => summary.errors.push(format!("{}: {}", table, e)),
            }
        }
        Ok(summary)
    }

    /// Tables with their own sync action
    pub fn logical_tables(&self) -> SyncResult<Vec<String>> {
        if !self.config.tables.is_empty() {
            return Ok(self.config.tables.clone());
        }
        Ok(self.collections.list_collections()?)
    }

    /// Run a sync action, reporting its start and outcome to the store
    fn run_sync<T, F>(&self, label: &str, op: F) -> SyncResult<T>
    where
        F: FnOnce() -> SyncResult<Completion<T>>,
    {
        self.store.dispatch(StoreAction::SyncStarted);

        match op() {
            Ok(Completion {
                value,
                export_result,
                failure: None,
            }) => {
                let at = Utc::now();
                if let Err(e) = self.sessions.record_sync_time(at) {
                    warn!("[SYNC] Failed to persist sync time: {:#}", e);
                }
                info!("[SYNC] {} completed", label);
                self.store.dispatch(StoreAction::SyncSucceeded { at, export_result });
                Ok(value)
            }
            Ok(Completion {
                value,
                export_result,
                failure: Some(message),
            }) => {
                warn!("[SYNC] {} completed with errors: {}", label, message);
                self.store.dispatch(StoreAction::SyncFailed {
                    message,
                    needs_reconnect: false,
                    export_result,
                });
                Ok(value)
            }
            Err(e) => {
                error!("[SYNC] {} failed: {}", label, e);
                self.store.dispatch(StoreAction::SyncFailed {
                    message: e.to_string(),
                    needs_reconnect: e.needs_reconnect(),
                    export_result: None,
                });
                Err(e)
            }
        }
    }

    /// Stop background work (token renewal, cache sweep)
    pub fn shutdown(&self) {
        self.credentials.shutdown();
        self.broker.stop_sweeper();
    }
}

fn export_completion(summary: ExportSummary) -> Completion<ExportSummary> {
    let failure = (!summary.is_success()).then(|| summary.errors.join("; "));
    Completion {
        export_result: Some(summary.clone()),
        value: summary,
        failure,
    }
}
