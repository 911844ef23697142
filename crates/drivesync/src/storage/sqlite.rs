//! SQLite-backed collection store

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use rusqlite_migration::{M, Migrations};
use serde_json::Value;

use super::traits::{CollectionStore, record_key};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Registered collections (kept even when empty)
            CREATE TABLE collections (
                name TEXT PRIMARY KEY
            );

            -- Records as JSON text, keyed by collection and record id
            CREATE TABLE records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT,
                PRIMARY KEY (collection, id),
                FOREIGN KEY (collection) REFERENCES collections(name) ON DELETE CASCADE
            );
            "#,
        ),
    ])
}

/// SQLite-based collection storage
///
/// Records are stored verbatim as JSON; `updated_at` is denormalized for
/// inspection only and never used for merge decisions.
pub struct SqliteCollectionStore {
    conn: Mutex<Connection>,
}

impl SqliteCollectionStore {
    /// Open (or create) a store at `db_path`
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets readers proceed during an import's writes.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Register a collection so it is listed even while empty
    pub fn create_collection(&self, name: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO collections (name) VALUES (?)",
            [name],
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn encode(record: &Value) -> Result<(String, String, Option<String>)> {
        let id = record_key(record)?;
        let body = serde_json::to_string(record).context("Failed to encode record")?;
        let updated_at = record
            .get("updatedAt")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok((id, body, updated_at))
    }
}

impl CollectionStore for SqliteCollectionStore {
    fn list_collections(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name FROM collections ORDER BY name ASC")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    fn get_all(&self, collection: &str) -> Result<Vec<Value>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, body FROM records WHERE collection = ? ORDER BY id ASC")?;
        let rows = stmt
            .query_map([collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, body)| {
                serde_json::from_str(&body)
                    .with_context(|| format!("Corrupt record {} in {}", id, collection))
            })
            .collect()
    }

    fn add(&self, collection: &str, record: Value) -> Result<()> {
        let (id, body, updated_at) = Self::encode(&record)?;
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO collections (name) VALUES (?)",
            [collection],
        )?;
        conn.execute(
            "INSERT INTO records (collection, id, body, updated_at) VALUES (?, ?, ?, ?)",
            params![collection, id, body, updated_at],
        )
        .with_context(|| format!("Record {} already exists in {}", id, collection))?;
        Ok(())
    }

    fn put(&self, collection: &str, record: Value) -> Result<()> {
        let (id, body, updated_at) = Self::encode(&record)?;
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO collections (name) VALUES (?)",
            [collection],
        )?;
        conn.execute(
            "INSERT INTO records (collection, id, body, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(collection, id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![collection, id, body, updated_at],
        )?;
        Ok(())
    }

    fn clear(&self, collection: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM records WHERE collection = ?", [collection])?;
        Ok(())
    }
}
