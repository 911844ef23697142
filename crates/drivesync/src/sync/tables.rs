//! Table export and import
//!
//! Every local collection maps to one remote resource `<app>/<table>.json`
//! holding a full snapshot. Exports always overwrite that resource wholesale;
//! imports read it back and, when pulling, merge it record by record into the
//! local collection.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;

use super::merge::merge_with_report;
use crate::config::EngineConfig;
use crate::drive::{DriveApi, DriveError};
use crate::error::{SyncError, SyncResult};
use crate::models::{ExportManifest, ExportSummary, ImportedTable, TableSnapshot};
use crate::storage::CollectionStore;

/// Batch error reported when the application folder holds no table resources
pub const NO_DATA_FILES: &str = "No data files found";

/// A table written to the remote store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableExport {
    pub table: String,
    /// Remote path of the written resource
    pub path: String,
    pub record_count: usize,
}

/// Tables read by a bulk import
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportBatch {
    pub tables: Vec<ImportedTable>,
    /// One entry per resource that could not be imported
    pub errors: Vec<String>,
}

impl ImportBatch {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.tables.is_empty()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.table_name.clone()).collect()
    }
}

/// Result of merging one remote table into the local store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TablePull {
    pub table: String,
    /// False when the table had never been exported
    pub found: bool,
    pub inserted: usize,
    pub replaced: usize,
    pub kept_local: usize,
    pub skipped: usize,
}

/// Result of merging every remote table into the local store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub tables: Vec<TablePull>,
    pub errors: Vec<String>,
}

impl PullSummary {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.tables.is_empty()
    }
}

/// Moves table snapshots between the local store and the remote drive
#[derive(Clone)]
pub struct TableTransfer {
    drive: Arc<dyn DriveApi>,
    collections: Arc<dyn CollectionStore>,
    config: Arc<EngineConfig>,
}

impl TableTransfer {
    pub fn new(
        drive: Arc<dyn DriveApi>,
        collections: Arc<dyn CollectionStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            drive,
            collections,
            config,
        }
    }

    /// Make sure the application folder exists, creating it (and any parents)
    pub fn ensure_app_folder(&self) -> SyncResult<()> {
        let mut current = String::new();
        for segment in self.config.app_folder.split('/').filter(|s| !s.is_empty()) {
            let path = crate::drive::join_path(&current, segment);
            if !self.drive.folder_exists(&path)? {
                info!("[SYNC] Creating remote folder {}", path);
                self.drive.create_folder(&current, segment)?;
            }
            current = path;
        }
        Ok(())
    }

    // === Export ===

    /// Upload the full contents of a local collection, replacing the remote copy
    pub fn export_table(&self, table: &str, user_id: &str) -> SyncResult<TableExport> {
        let records = self.collections.get_all(table)?;
        let snapshot = TableSnapshot::new(self.config.db_name.as_str(), table, records);
        let path = self.config.table_path(table);

        let body = serde_json::to_vec_pretty(&snapshot)?;
        self.drive.write_file(&path, &body)?;

        info!(
            "[EXPORT] Wrote {} ({} records) for user {}",
            path, snapshot.record_count, user_id
        );
        Ok(TableExport {
            table: table.to_string(),
            path,
            record_count: snapshot.record_count,
        })
    }

    /// Export every local collection and write the manifest
    ///
    /// Tables are exported independently; a failing table is reported in
    /// `errors` without stopping the others.
    pub fn export_all_tables(&self, user_id: &str) -> SyncResult<ExportSummary> {
        let tables = self.collections.list_collections()?;
        let mut summary = ExportSummary::default();

        for table in &tables {
            match self.export_table(table, user_id) {
                Ok(_) => summary.tables.push(table.clone()),
                Err(e) => {
                    warn!("[EXPORT] Failed to export {}: {}", table, e);
                    summary.errors.push(format!("{}: {}", table, e));
                }
            }
        }

        let manifest = ExportManifest::new(
            user_id,
            self.config.app_version.as_str(),
            summary.tables.clone(),
        );
        let manifest_path = self.config.manifest_path();
        match self.write_json(&manifest_path, &manifest) {
            Ok(()) => summary.manifest_path = Some(manifest_path),
            Err(e) => {
                warn!("[EXPORT] Failed to write manifest: {}", e);
                summary.errors.push(format!("manifest: {}", e));
            }
        }

        info!(
            "[EXPORT] Exported {}/{} tables ({} errors)",
            summary.tables.len(),
            tables.len(),
            summary.errors.len()
        );
        Ok(summary)
    }

    fn write_json<T: serde::Serialize>(&self, path: &str, value: &T) -> SyncResult<()> {
        let body = serde_json::to_vec_pretty(value)?;
        self.drive.write_file(path, &body)?;
        Ok(())
    }

    // === Import ===

    /// Read one table from the remote store
    ///
    /// A table that was never exported yields an empty result, not an error.
    pub fn import_table(&self, table: &str) -> SyncResult<ImportedTable> {
        let path = self.config.table_path(table);
        let bytes = match self.drive.read_file(&path) {
            Ok(bytes) => bytes,
            Err(DriveError::NotFound(_)) => {
                debug!("[IMPORT] {} not found remotely, treating as empty", path);
                return Ok(ImportedTable::empty(table));
            }
            Err(e) => return Err(e.into()),
        };

        let imported = parse_table(&path, &bytes)?;
        if imported.table_name != table {
            warn!(
                "[IMPORT] {} declares table '{}', expected '{}'",
                path, imported.table_name, table
            );
        }
        info!("[IMPORT] Read {} records from {}", imported.record_count(), path);
        Ok(imported)
    }

    /// Read every table resource in the application folder
    ///
    /// Fails only when the folder cannot be reached or set up. Malformed
    /// resources are reported per file; finding no table resources at all is
    /// reported as an error in the batch.
    pub fn import_all_tables(&self, user_id: &str) -> SyncResult<ImportBatch> {
        self.ensure_app_folder()?;
        let children = self.drive.list_children(&self.config.app_folder)?;

        let candidates: Vec<_> = children
            .into_iter()
            .filter(|item| {
                !item.is_folder
                    && item.name.ends_with(".json")
                    && item.name != self.config.manifest_name
            })
            .collect();

        let mut batch = ImportBatch::default();
        if candidates.is_empty() {
            warn!("[IMPORT] No data files found for user {}", user_id);
            batch.errors.push(NO_DATA_FILES.to_string());
            return Ok(batch);
        }

        for item in candidates {
            let path = crate::drive::join_path(&self.config.app_folder, &item.name);
            let result = self
                .drive
                .read_file(&path)
                .map_err(SyncError::from)
                .and_then(|bytes| parse_table(&path, &bytes));

            match result {
                Ok(table) => batch.tables.push(table),
                Err(e) => {
                    warn!("[IMPORT] Skipping {}: {}", item.name, e);
                    batch.errors.push(format!("{}: {}", item.name, e));
                }
            }
        }

        info!(
            "[IMPORT] Read {} tables for user {} ({} errors)",
            batch.tables.len(),
            user_id,
            batch.errors.len()
        );
        Ok(batch)
    }

    // === Pull (import + merge) ===

    /// Import one table and merge it into the local collection
    ///
    /// Records land in `table` whatever name the remote resource declares.
    pub fn pull_table(&self, table: &str) -> SyncResult<TablePull> {
        let imported = self.import_table(table)?;
        self.merge_into_local(table, imported)
    }

    /// Import every remote table and merge each into its local collection
    pub fn pull_all_tables(&self, user_id: &str) -> SyncResult<PullSummary> {
        let batch = self.import_all_tables(user_id)?;
        let mut summary = PullSummary {
            tables: Vec::new(),
            errors: batch.errors,
        };

        for imported in batch.tables {
            let table = imported.table_name.clone();
            match self.merge_into_local(&table, imported) {
                Ok(pull) => summary.tables.push(pull),
                Err(e) => {
                    warn!("[IMPORT] Failed to merge {}: {}", table, e);
                    summary.errors.push(format!("{}: {}", table, e));
                }
            }
        }
        Ok(summary)
    }

    fn merge_into_local(&self, table: &str, imported: ImportedTable) -> SyncResult<TablePull> {
        let found = imported.found;

        let existing = self.collections.get_all(table)?;
        let report = merge_with_report(existing, imported.records);
        for record in report.changed {
            self.collections.put(table, record)?;
        }

        debug!(
            "[IMPORT] Merged {}: {} inserted, {} replaced, {} kept local",
            table, report.inserted, report.replaced, report.kept_local
        );
        Ok(TablePull {
            table: table.to_string(),
            found,
            inserted: report.inserted,
            replaced: report.replaced,
            kept_local: report.kept_local,
            skipped: report.skipped,
        })
    }
}

/// Parse and validate a table resource
fn parse_table(path: &str, bytes: &[u8]) -> SyncResult<ImportedTable> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| SyncError::Validation(format!("{} is not valid JSON: {}", path, e)))?;
    ImportedTable::from_value(value).map_err(|msg| SyncError::Validation(format!("{}: {}", path, msg)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{DriveCall, InMemoryDrive};
    use crate::storage::InMemoryCollectionStore;
    use serde_json::json;

    fn setup() -> (TableTransfer, Arc<InMemoryDrive>, Arc<InMemoryCollectionStore>) {
        let drive = Arc::new(InMemoryDrive::new());
        let collections = Arc::new(InMemoryCollectionStore::new());
        let transfer = TableTransfer::new(
            drive.clone(),
            collections.clone(),
            Arc::new(EngineConfig::default()),
        );
        (transfer, drive, collections)
    }

    #[test]
    fn test_export_table_writes_snapshot() {
        let (transfer, drive, collections) = setup();
        collections
            .put("users", json!({"id": "u1", "updatedAt": "2025-01-01T00:00:00Z"}))
            .unwrap();
        collections
            .put("users", json!({"id": "u2", "updatedAt": "2025-01-02T00:00:00Z"}))
            .unwrap();

        let export = transfer.export_table("users", "user-1").unwrap();
        assert_eq!(export.path, "drivesync/users.json");

        let remote = drive.file_json("drivesync/users.json").unwrap();
        assert_eq!(remote["recordCount"], 2);
        assert_eq!(remote["tableName"], "users");
        assert_eq!(remote["dbName"], "drivesync");
        assert_eq!(
            remote["data"],
            json!([
                {"id": "u1", "updatedAt": "2025-01-01T00:00:00Z"},
                {"id": "u2", "updatedAt": "2025-01-02T00:00:00Z"}
            ])
        );
    }

    #[test]
    fn test_export_overwrites_remote_copy() {
        let (transfer, drive, collections) = setup();
        collections.put("users", json!({"id": "u1"})).unwrap();
        transfer.export_table("users", "user-1").unwrap();

        collections.clear("users").unwrap();
        transfer.export_table("users", "user-1").unwrap();

        let remote = drive.file_json("drivesync/users.json").unwrap();
        assert_eq!(remote["recordCount"], 0);
        assert_eq!(remote["data"], json!([]));
    }

    #[test]
    fn test_export_all_collects_errors_and_writes_manifest() {
        let (transfer, drive, collections) = setup();
        collections.put("notes", json!({"id": "n1"})).unwrap();
        collections.put("users", json!({"id": "u1"})).unwrap();
        drive.fail_path(
            "drivesync/notes.json",
            DriveError::Http {
                status: 507,
                message: "quota".to_string(),
            },
        );

        let summary = transfer.export_all_tables("user-1").unwrap();
        assert!(!summary.is_success());
        assert_eq!(summary.tables, vec!["users".to_string()]);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].starts_with("notes:"));

        let manifest = drive.file_json("drivesync/export_metadata.json").unwrap();
        assert_eq!(manifest["version"], "1.0");
        assert_eq!(manifest["userId"], "user-1");
        assert_eq!(manifest["tables"], json!(["users"]));
    }

    #[test]
    fn test_import_missing_table_is_empty() {
        let (transfer, _drive, _collections) = setup();
        let imported = transfer.import_table("users").unwrap();
        assert!(!imported.found);
        assert_eq!(imported.record_count(), 0);
        assert_eq!(imported.table_name, "users");
    }

    #[test]
    fn test_import_rejects_malformed_table() {
        let (transfer, drive, _collections) = setup();
        drive.insert_file("drivesync/users.json", br#"{"tableName": "users", "data": {}}"#.to_vec());
        assert!(matches!(
            transfer.import_table("users"),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_import_auth_failure_propagates() {
        let (transfer, drive, _collections) = setup();
        drive.fail_always(DriveCall::ReadFile, DriveError::Unauthorized("expired".to_string()));
        let err = transfer.import_table("users").unwrap_err();
        assert!(err.needs_reconnect());
    }

    #[test]
    fn test_import_all_with_only_manifest() {
        let (transfer, drive, _collections) = setup();
        drive.insert_file("drivesync/export_metadata.json", br#"{"version": "1.0"}"#.to_vec());

        let batch = transfer.import_all_tables("user-1").unwrap();
        assert!(!batch.is_success());
        assert_eq!(batch.errors, vec![NO_DATA_FILES.to_string()]);
    }

    #[test]
    fn test_import_all_reports_bad_files_and_keeps_going() {
        let (transfer, drive, _collections) = setup();
        drive.insert_file(
            "drivesync/users.json",
            serde_json::to_vec(&TableSnapshot::new("drivesync", "users", vec![json!({"id": "u1"})])).unwrap(),
        );
        drive.insert_file("drivesync/broken.json", b"{not json".to_vec());
        drive.insert_file("drivesync/readme.txt", b"hello".to_vec());
        drive.insert_file("drivesync/attachments/a.json", b"{}".to_vec());

        let batch = transfer.import_all_tables("user-1").unwrap();
        assert_eq!(batch.table_names(), vec!["users".to_string()]);
        assert_eq!(batch.errors.len(), 1);
        assert!(batch.errors[0].starts_with("broken.json"));
    }

    #[test]
    fn test_import_all_creates_missing_folder() {
        let (transfer, drive, _collections) = setup();
        let batch = transfer.import_all_tables("user-1").unwrap();
        assert!(drive.has_folder("drivesync"));
        assert!(!batch.is_success());
    }

    #[test]
    fn test_import_all_fails_when_offline() {
        let (transfer, drive, _collections) = setup();
        drive.fail_all(DriveError::Connectivity("offline".to_string()));
        assert!(matches!(
            transfer.import_all_tables("user-1"),
            Err(SyncError::Connectivity(_))
        ));
    }

    #[test]
    fn test_pull_table_merges_newest() {
        let (transfer, drive, collections) = setup();
        collections
            .put("notes", json!({"id": "x", "updatedAt": "2025-01-01T10:00:00Z", "v": "local"}))
            .unwrap();
        collections
            .put("notes", json!({"id": "y", "updatedAt": "2025-01-05T10:00:00Z", "v": "local"}))
            .unwrap();

        let remote = TableSnapshot::new(
            "drivesync",
            "notes",
            vec![
                json!({"id": "x", "updatedAt": "2025-01-02T10:00:00Z", "v": "remote"}),
                json!({"id": "y", "updatedAt": "2025-01-04T10:00:00Z", "v": "remote"}),
                json!({"id": "z", "updatedAt": "2025-01-03T10:00:00Z", "v": "remote"}),
            ],
        );
        drive.insert_file("drivesync/notes.json", serde_json::to_vec(&remote).unwrap());

        let pull = transfer.pull_table("notes").unwrap();
        assert!(pull.found);
        assert_eq!((pull.inserted, pull.replaced, pull.kept_local), (1, 1, 1));

        let local = collections.get_all("notes").unwrap();
        let values: Vec<_> = local.iter().map(|r| r["v"].as_str().unwrap()).collect();
        assert_eq!(values, vec!["remote", "local", "remote"]);
    }

    #[test]
    fn test_pull_table_merges_into_requested_table() {
        let (transfer, drive, collections) = setup();
        let mislabeled = TableSnapshot::new(
            "drivesync",
            "users",
            vec![json!({"id": "n1", "updatedAt": "2025-01-01T00:00:00Z"})],
        );
        drive.insert_file("drivesync/notes.json", serde_json::to_vec(&mislabeled).unwrap());

        let pull = transfer.pull_table("notes").unwrap();
        assert_eq!(pull.table, "notes");
        assert_eq!(pull.inserted, 1);
        assert_eq!(collections.count("notes"), 1);
        assert_eq!(collections.count("users"), 0);
    }

    #[test]
    fn test_ensure_app_folder_is_idempotent() {
        let (transfer, drive, _collections) = setup();
        transfer.ensure_app_folder().unwrap();
        transfer.ensure_app_folder().unwrap();
        assert!(drive.has_folder("drivesync"));
        assert_eq!(drive.call_count(DriveCall::CreateFolder), 1);
    }
}
