//! Durable local storage
//!
//! The engine only needs a small key-value contract that survives process
//! restarts. Values are JSON strings written by the queue and the cache.
//!
//! - [`MemoryStorage`]: process-local map, used in tests and as a fallback
//! - [`SqliteStorage`]: single-table SQLite file

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::StorageError;

/// Key-value persistence used to back the action queue and cache store.
///
/// All calls are synchronous: enqueueing must be persisted before
/// `mutate` returns.
pub trait KvStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Build a namespaced storage key.
pub(crate) fn namespaced(namespace: &str, key: &str) -> String {
    format!("{}:{}", namespace, key)
}
