//! In-memory storage implementations
//!
//! Used for tests and for hosts that keep their collections elsewhere and
//! only hand snapshots to the engine.

use anyhow::Result;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::traits::{CollectionStore, KeyValueStore, record_key};

/// In-memory implementation of CollectionStore
///
/// Collections map record ids to records, so `get_all` returns records in id
/// order.
pub struct InMemoryCollectionStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryCollectionStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a store with empty collections already registered
    pub fn with_collections<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        {
            let mut collections = store.collections.write().unwrap_or_else(|p| p.into_inner());
            for name in names {
                collections.entry(name.into()).or_default();
            }
        }
        store
    }

    /// Number of records in a collection
    pub fn count(&self, collection: &str) -> usize {
        let collections = self.collections.read().unwrap_or_else(|p| p.into_inner());
        collections.get(collection).map_or(0, BTreeMap::len)
    }
}

impl Default for InMemoryCollectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectionStore for InMemoryCollectionStore {
    fn list_collections(&self) -> Result<Vec<String>> {
        let collections = self.collections.read().unwrap_or_else(|p| p.into_inner());
        Ok(collections.keys().cloned().collect())
    }

    fn get_all(&self, collection: &str) -> Result<Vec<Value>> {
        let collections = self.collections.read().unwrap_or_else(|p| p.into_inner());
        Ok(collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    fn add(&self, collection: &str, record: Value) -> Result<()> {
        let id = record_key(&record)?;
        let mut collections = self.collections.write().unwrap_or_else(|p| p.into_inner());
        let records = collections.entry(collection.to_string()).or_default();
        if records.contains_key(&id) {
            anyhow::bail!("Record {} already exists in {}", id, collection);
        }
        records.insert(id, record);
        Ok(())
    }

    fn put(&self, collection: &str, record: Value) -> Result<()> {
        let id = record_key(&record)?;
        let mut collections = self.collections.write().unwrap_or_else(|p| p.into_inner());
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, record);
        Ok(())
    }

    fn clear(&self, collection: &str) -> Result<()> {
        let mut collections = self.collections.write().unwrap_or_else(|p| p.into_inner());
        if let Some(records) = collections.get_mut(collection) {
            records.clear();
        }
        Ok(())
    }
}

/// In-memory implementation of KeyValueStore
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_and_get_all() {
        let store = InMemoryCollectionStore::new();
        store.put("users", json!({"id": "u2", "name": "B"})).unwrap();
        store.put("users", json!({"id": "u1", "name": "A"})).unwrap();

        let records = store.get_all("users").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], "u1");
        assert_eq!(store.list_collections().unwrap(), vec!["users".to_string()]);
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let store = InMemoryCollectionStore::new();
        store.add("users", json!({"id": "u1"})).unwrap();
        assert!(store.add("users", json!({"id": "u1"})).is_err());
    }

    #[test]
    fn test_put_replaces() {
        let store = InMemoryCollectionStore::new();
        store.put("users", json!({"id": "u1", "name": "old"})).unwrap();
        store.put("users", json!({"id": "u1", "name": "new"})).unwrap();
        assert_eq!(store.count("users"), 1);
        assert_eq!(store.get_all("users").unwrap()[0]["name"], "new");
    }

    #[test]
    fn test_record_without_id_is_rejected() {
        let store = InMemoryCollectionStore::new();
        assert!(store.put("users", json!({"name": "anon"})).is_err());
    }

    #[test]
    fn test_clear_keeps_collection() {
        let store = InMemoryCollectionStore::with_collections(["users", "notes"]);
        store.put("users", json!({"id": "u1"})).unwrap();
        store.clear("users").unwrap();
        assert_eq!(store.count("users"), 0);
        assert_eq!(store.list_collections().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_collection_is_empty() {
        let store = InMemoryCollectionStore::new();
        assert!(store.get_all("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_key_value_roundtrip() {
        let kv = InMemoryKeyValueStore::new();
        assert!(kv.get("a").unwrap().is_none());
        kv.set("a", "1").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("1"));
        kv.remove("a").unwrap();
        kv.remove("a").unwrap();
        assert!(kv.get("a").unwrap().is_none());
    }
}
