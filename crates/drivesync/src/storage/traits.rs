//! Storage trait definitions

use anyhow::Result;
use serde_json::Value;

/// Named collections of JSON records keyed by their `id` field
///
/// This is the local, offline-first store the engine exports from and merges
/// into. Implementations must be safe to share across threads.
pub trait CollectionStore: Send + Sync {
    /// Names of all collections, in a stable order
    fn list_collections(&self) -> Result<Vec<String>>;

    /// Every record of a collection (empty if the collection doesn't exist)
    fn get_all(&self, collection: &str) -> Result<Vec<Value>>;

    /// Insert a new record; fails if a record with the same id exists
    fn add(&self, collection: &str, record: Value) -> Result<()>;

    /// Insert or replace a record by id
    fn put(&self, collection: &str, record: Value) -> Result<()>;

    /// Remove every record from a collection
    fn clear(&self, collection: &str) -> Result<()>;
}

/// Durable string entries that survive process restarts
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove an entry; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;
}

/// Extract the record id used as the storage key
pub(crate) fn record_key(record: &Value) -> Result<String> {
    match record.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => anyhow::bail!("Record is missing a string 'id' field"),
    }
}
