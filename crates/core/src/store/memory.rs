//! In-process store.

use super::{KeyValueStore, StoreResult, Versioned};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Store backed by a `BTreeMap` behind an async `RwLock`.
///
/// Versions come from one counter for the whole store, so a key that is
/// deleted and recreated never reuses an old version.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Versioned>>,
    next_version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> StoreResult<u64> {
        let mut entries = self.entries.write().await;
        let version = self.bump();
        entries.insert(key.to_string(), Versioned { version, value });
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
    ) -> StoreResult<bool> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).map(|entry| entry.version);
        if current != expected {
            return Ok(false);
        }
        let version = self.bump();
        entries.insert(key.to_string(), Versioned { version, value });
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, version: u64) -> StoreResult<bool> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.version == version => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
