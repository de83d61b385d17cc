//! Versioned key-value backing store.
//!
//! The Resource Registry, the Lock Manager and the distributed job queue all
//! keep their shared state here. Every value carries a version that changes on
//! each write, which is what the compare-and-set operations check against.
//!
//! Two implementations are provided:
//! - [`MemoryStore`]: a single process map, used by the local queue and tests
//! - [`FileStore`]: a directory shared by several processes

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// A stored value together with its current version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: String,
}

/// Errors raised by a backing store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt entry for key '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Timed out waiting for the write lock on key '{key}'")]
    LockTimeout { key: String },

    #[error("Failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared, concurrency-safe key-value store with versioned entries.
///
/// Readers never block writers: `get` always returns a complete value as of
/// some committed write.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>>;

    /// Unconditional write. Returns the new version.
    async fn put(&self, key: &str, value: String) -> StoreResult<u64>;

    /// Write `value` only if the current version equals `expected`
    /// (`None` meaning "key absent"). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
    ) -> StoreResult<bool>;

    /// Delete the key only if its current version equals `version`.
    async fn compare_and_delete(&self, key: &str, version: u64) -> StoreResult<bool>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Keys starting with `prefix`, in ascending order.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every store implementation must share.

    use super::*;

    pub async fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("a/1").await.unwrap(), None);

        assert!(store
            .compare_and_swap("a/1", None, "one".to_string())
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("a/1", None, "again".to_string())
            .await
            .unwrap());

        let current = store.get("a/1").await.unwrap().unwrap();
        assert_eq!(current.value, "one");

        assert!(!store
            .compare_and_swap("a/1", Some(current.version + 100), "stale".to_string())
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("a/1", Some(current.version), "two".to_string())
            .await
            .unwrap());

        let updated = store.get("a/1").await.unwrap().unwrap();
        assert_eq!(updated.value, "two");
        assert_ne!(updated.version, current.version);

        store.put("a/2", "x".to_string()).await.unwrap();
        store.put("b/1", "y".to_string()).await.unwrap();
        assert_eq!(store.list("a/").await.unwrap(), vec!["a/1", "a/2"]);

        assert!(!store
            .compare_and_delete("a/1", current.version)
            .await
            .unwrap());
        assert!(store
            .compare_and_delete("a/1", updated.version)
            .await
            .unwrap());
        assert!(store.delete("a/2").await.unwrap());
        assert!(!store.delete("a/2").await.unwrap());
        assert!(store.list("a/").await.unwrap().is_empty());
    }
}
