//! File-backed key-value store
//!
//! All entries live in one JSON object on disk, rewritten atomically on every
//! change. Entries are few and small (session and sync-time records).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use super::traits::KeyValueStore;

/// Default file name inside the drivesync config directory
const DEFAULT_FILE: &str = "sync-state.json";

/// Key-value store persisted as a single JSON file
pub struct FileKeyValueStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileKeyValueStore {
    /// Open a store at `path`, loading existing entries
    ///
    /// A missing file starts empty; an unreadable one is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            config::load_json_file(&path)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Open the store in the drivesync config directory
    pub fn open_default() -> Result<Self> {
        let path = config::config_path(DEFAULT_FILE).context("Could not determine config directory")?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        config::save_json_file(&self.path, entries)
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let mut next = entries.clone();
        next.insert(key.to_string(), value.to_string());
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.remove(key);
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.json");

        {
            let kv = FileKeyValueStore::open(&path).unwrap();
            kv.set("session", "{\"a\":1}").unwrap();
            kv.set("backup", "2025-01-01T00:00:00Z").unwrap();
        }

        let kv = FileKeyValueStore::open(&path).unwrap();
        assert_eq!(kv.get("session").unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(kv.get("backup").unwrap().as_deref(), Some("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_remove_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.json");

        let kv = FileKeyValueStore::open(&path).unwrap();
        kv.set("session", "x").unwrap();
        kv.remove("session").unwrap();
        drop(kv);

        let kv = FileKeyValueStore::open(&path).unwrap();
        assert!(kv.get("session").unwrap().is_none());
    }

    #[test]
    fn test_failed_write_leaves_entries_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.json");

        let kv = FileKeyValueStore::open(&path).unwrap();
        kv.set("session", "old").unwrap();

        // A directory in the way of the temp file makes every write fail.
        std::fs::create_dir(dir.path().join("kv.json.tmp")).unwrap();

        assert!(kv.set("session", "new").is_err());
        assert_eq!(kv.get("session").unwrap().as_deref(), Some("old"));

        assert!(kv.remove("session").is_err());
        assert_eq!(kv.get("session").unwrap().as_deref(), Some("old"));

        drop(kv);
        let kv = FileKeyValueStore::open(&path).unwrap();
        assert_eq!(kv.get("session").unwrap().as_deref(), Some("old"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(FileKeyValueStore::open(&path).is_err());
    }
}
