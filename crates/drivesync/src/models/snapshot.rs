//! Remote table snapshot and manifest formats

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::parse_timestamp;

/// Full serialized contents of one local collection
///
/// Written wholesale to `<tableName>.json` on every export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSnapshot {
    pub db_name: String,
    pub table_name: String,
    pub export_time: DateTime<Utc>,
    pub sync_time: DateTime<Utc>,
    pub record_count: usize,
    pub data: Vec<Value>,
}

impl TableSnapshot {
    /// Wrap the records of a table, stamped with the current time
    pub fn new(db_name: impl Into<String>, table_name: impl Into<String>, data: Vec<Value>) -> Self {
        let now = Utc::now();
        Self {
            db_name: db_name.into(),
            table_name: table_name.into(),
            export_time: now,
            sync_time: now,
            record_count: data.len(),
            data,
        }
    }
}

/// Manifest written next to the table snapshots by bulk exports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportManifest {
    /// Manifest format version
    pub version: String,
    pub export_time: DateTime<Utc>,
    pub user_id: String,
    pub app_version: String,
    pub tables: Vec<String>,
}

impl ExportManifest {
    pub const FORMAT_VERSION: &'static str = "1.0";

    pub fn new(user_id: impl Into<String>, app_version: impl Into<String>, tables: Vec<String>) -> Self {
        Self {
            version: Self::FORMAT_VERSION.to_string(),
            export_time: Utc::now(),
            user_id: user_id.into(),
            app_version: app_version.into(),
            tables,
        }
    }
}

/// Table resource fields read on import; everything else is ignored
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTable {
    table_name: String,
    data: Vec<Value>,
    /// Kept loose so an odd export time does not reject the records
    #[serde(default)]
    export_time: Option<Value>,
}

/// Records read back from one remote table resource
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedTable {
    pub table_name: String,
    pub records: Vec<Value>,
    /// Export time recorded in the resource, if present and parseable
    pub export_time: Option<DateTime<Utc>>,
    /// False when the remote resource did not exist
    pub found: bool,
}

impl ImportedTable {
    /// Result for a table that has never been exported
    pub fn empty(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            records: Vec::new(),
            export_time: None,
            found: false,
        }
    }

    /// Validate a parsed resource has the `{tableName, data: [..]}` shape
    pub fn from_value(value: Value) -> Result<Self, String> {
        let wire: WireTable = serde_json::from_value(value).map_err(|e| e.to_string())?;
        if wire.table_name.is_empty() {
            return Err("tableName must not be empty".to_string());
        }

        let export_time = wire
            .export_time
            .as_ref()
            .and_then(Value::as_str)
            .and_then(parse_timestamp);

        Ok(Self {
            table_name: wire.table_name,
            records: wire.data,
            export_time,
            found: true,
        })
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_counts_records() {
        let snapshot = TableSnapshot::new("db", "users", vec![json!({"id": "u1"}), json!({"id": "u2"})]);
        assert_eq!(snapshot.record_count, 2);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["tableName"], "users");
        assert_eq!(json["recordCount"], 2);
        assert_eq!(json["dbName"], "db");
    }

    #[test]
    fn test_imported_table_from_snapshot_json() {
        let snapshot = TableSnapshot::new("db", "notes", vec![json!({"id": "n1"})]);
        let value = serde_json::to_value(&snapshot).unwrap();

        let imported = ImportedTable::from_value(value).unwrap();
        assert_eq!(imported.table_name, "notes");
        assert_eq!(imported.records, vec![json!({"id": "n1"})]);
        assert!(imported.found);
        assert!(imported.export_time.is_some());
    }

    #[test]
    fn test_imported_table_rejects_bad_shapes() {
        assert!(ImportedTable::from_value(json!([1, 2])).is_err());
        assert!(ImportedTable::from_value(json!({"data": []})).is_err());
        assert!(ImportedTable::from_value(json!({"tableName": "t"})).is_err());
        assert!(ImportedTable::from_value(json!({"tableName": "t", "data": {}})).is_err());
        assert!(ImportedTable::from_value(json!({"tableName": 5, "data": []})).is_err());
        assert!(ImportedTable::from_value(json!({"tableName": "", "data": []})).is_err());
    }

    #[test]
    fn test_shape_errors_name_the_field() {
        let err = ImportedTable::from_value(json!({"tableName": "t"})).unwrap_err();
        assert!(err.contains("data"), "{}", err);

        let err = ImportedTable::from_value(json!({"tableName": "t", "data": "rows"})).unwrap_err();
        assert!(err.contains("invalid type"), "{}", err);
    }

    #[test]
    fn test_odd_export_time_is_ignored() {
        let imported =
            ImportedTable::from_value(json!({"tableName": "t", "data": [], "exportTime": 17})).unwrap();
        assert!(imported.export_time.is_none());

        let imported =
            ImportedTable::from_value(json!({"tableName": "t", "data": [], "exportTime": "2025-01-01"}))
                .unwrap();
        assert!(imported.export_time.is_some());
    }

    #[test]
    fn test_minimal_shape_is_accepted() {
        let imported = ImportedTable::from_value(json!({"tableName": "t", "data": []})).unwrap();
        assert_eq!(imported.record_count(), 0);
        assert!(imported.export_time.is_none());
    }

    #[test]
    fn test_manifest_fields() {
        let manifest = ExportManifest::new("user-1", "0.1.0", vec!["users".to_string()]);
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["version"], "1.0");
        assert_eq!(json["userId"], "user-1");
        assert_eq!(json["appVersion"], "0.1.0");
        assert_eq!(json["tables"], json!(["users"]));
    }
}
