//! Local storage traits and implementations
//!
//! Two seams back the engine on the device:
//! - `CollectionStore`: the named tables of JSON records being synchronized
//! - `KeyValueStore`: small durable entries (session and sync-time records)
//!
//! Each has an in-memory implementation for tests and a persistent one.

mod kv_file;
mod memory;
mod session_store;
mod sqlite;
mod traits;

pub use kv_file::FileKeyValueStore;
pub use memory::{InMemoryCollectionStore, InMemoryKeyValueStore};
pub use session_store::{SessionStore, SyncRecord, keys};
pub use sqlite::SqliteCollectionStore;
pub use traits::{CollectionStore, KeyValueStore};
