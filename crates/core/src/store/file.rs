//! Directory backed store shared between processes.
//!
//! Layout under the root directory:
//!
//! ```text
//! data/<encoded key>.json   committed entries ({"version": .., "value": ..})
//! locks/<encoded key>.lock  per-key write locks (created with O_EXCL)
//! locks/<encoded key>.break held while a stale lock is being removed
//! tmp/                      staging area for atomic renames
//! ```
//!
//! Writers serialize on the per-key lock file; readers only ever see files
//! that were fully written and then renamed into place.

use super::{KeyValueStore, StoreError, StoreResult, Versioned};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;

const LOCK_ATTEMPTS: usize = 500;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
/// A lock file older than this belongs to a crashed writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FileStore {
    data_dir: PathBuf,
    locks_dir: PathBuf,
    tmp_dir: PathBuf,
}

/// Held per-key write lock; the lock file is removed on drop.
struct KeyLock {
    path: PathBuf,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        let store = Self {
            data_dir: root.join("data"),
            locks_dir: root.join("locks"),
            tmp_dir: root.join("tmp"),
        };
        for dir in [&store.data_dir, &store.locks_dir, &store.tmp_dir] {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(store)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", encode_key(key)))
    }

    async fn lock(&self, key: &str) -> StoreResult<KeyLock> {
        let path = self.locks_dir.join(format!("{}.lock", encode_key(key)));

        for _ in 0..LOCK_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(KeyLock { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path).await && break_stale(&path, key).await? {
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(source) => return Err(StoreError::Io { path, source }),
            }
        }

        Err(StoreError::LockTimeout {
            key: key.to_string(),
        })
    }

    async fn read_entry(&self, key: &str) -> StoreResult<Option<Versioned>> {
        let path = self.entry_path(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn write_entry(&self, key: &str, entry: &Versioned) -> StoreResult<()> {
        let staging = self.tmp_dir.join(uuid::Uuid::new_v4().to_string());
        let body = serde_json::to_vec(entry)?;

        fs::write(&staging, body)
            .await
            .map_err(|source| StoreError::Io {
                path: staging.clone(),
                source,
            })?;

        let target = self.entry_path(key);
        fs::rename(&staging, &target)
            .await
            .map_err(|source| StoreError::Io {
                path: target,
                source,
            })
    }

    async fn remove_entry(&self, key: &str) -> StoreResult<bool> {
        let path = self.entry_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

fn next_version(current: Option<&Versioned>) -> u64 {
    match current {
        Some(entry) => entry.version + 1,
        // Fresh keys start from the clock so a recreated key does not
        // repeat the versions of its previous incarnation.
        None => chrono::Utc::now().timestamp_micros().max(1) as u64,
    }
}

/// Remove the stale lock at `path`, returning whether it was removed.
///
/// Breakers serialize on a companion `.break` file and check the lock again
/// once they hold it, so a lock recreated by another writer in the meantime
/// is left alone.
async fn break_stale(path: &Path, key: &str) -> StoreResult<bool> {
    let breaker = path.with_extension("break");
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&breaker)
        .await
    {
        Ok(_) => {
            let _guard = KeyLock { path: breaker };
            if !is_stale(path).await {
                return Ok(false);
            }
            tracing::warn!(key, "Removing stale store lock");
            match fs::remove_file(path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(source) => Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                }),
            }
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            if is_stale(&breaker).await {
                tracing::warn!(key, "Removing abandoned store lock breaker");
                let _ = fs::remove_file(&breaker).await;
            }
            Ok(false)
        }
        Err(source) => Err(StoreError::Io {
            path: breaker,
            source,
        }),
    }
}

async fn is_stale(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path).await else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

/// Percent-encode every byte outside `[A-Za-z0-9._-]`.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        self.read_entry(key).await
    }

    async fn put(&self, key: &str, value: String) -> StoreResult<u64> {
        let _lock = self.lock(key).await?;
        let current = self.read_entry(key).await?;
        let entry = Versioned {
            version: next_version(current.as_ref()),
            value,
        };
        self.write_entry(key, &entry).await?;
        Ok(entry.version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
    ) -> StoreResult<bool> {
        let _lock = self.lock(key).await?;
        let current = self.read_entry(key).await?;
        if current.as_ref().map(|entry| entry.version) != expected {
            return Ok(false);
        }
        let entry = Versioned {
            version: next_version(current.as_ref()),
            value,
        };
        self.write_entry(key, &entry).await?;
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, version: u64) -> StoreResult<bool> {
        let _lock = self.lock(key).await?;
        match self.read_entry(key).await? {
            Some(entry) if entry.version == version => self.remove_entry(key).await,
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let _lock = self.lock(key).await?;
        self.remove_entry(key).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut dir = fs::read_dir(&self.data_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.data_dir.clone(),
                source,
            })?;

        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|source| StoreError::Io {
            path: self.data_dir.clone(),
            source,
        })? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(key) = decode_key(stem) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_key_encoding() {
        let key = "lock/nc_spm_08/user 1%";
        let encoded = encode_key(key);
        assert!(!encoded.contains('/'));
        assert_eq!(decode_key(&encoded).as_deref(), Some(key));
    }

    #[tokio::test]
    async fn test_file_store_contract() {
        let dir = tempdir().expect("Failed to create temp dir");
        let store = FileStore::open(dir.path()).expect("Failed to open store");
        crate::store::contract::exercise(&store).await;
    }

    fn age(path: &Path) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - STALE_LOCK_AGE * 2)
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken_once() {
        let dir = tempdir().expect("Failed to create temp dir");
        let store = FileStore::open(dir.path()).expect("Failed to open store");
        let lock = store.locks_dir.join(format!("{}.lock", encode_key("resource/r1")));

        std::fs::write(&lock, "").unwrap();
        age(&lock);
        assert!(break_stale(&lock, "resource/r1").await.unwrap());
        assert!(!lock.exists());
        assert!(!lock.with_extension("break").exists());

        // A writer that saw the old lock finds a fresh one in its place.
        std::fs::write(&lock, "").unwrap();
        assert!(!break_stale(&lock, "resource/r1").await.unwrap());
        assert!(lock.exists());
        std::fs::remove_file(&lock).unwrap();

        // Writes go through once the stale lock is gone.
        std::fs::write(&lock, "").unwrap();
        age(&lock);
        store.put("resource/r1", "payload".to_string()).await.unwrap();
        assert!(!lock.exists());
    }

    #[tokio::test]
    async fn test_stale_lock_is_left_to_the_active_breaker() {
        let dir = tempdir().expect("Failed to create temp dir");
        let store = FileStore::open(dir.path()).expect("Failed to open store");
        let lock = store.locks_dir.join(format!("{}.lock", encode_key("resource/r1")));
        let breaker = lock.with_extension("break");

        std::fs::write(&lock, "").unwrap();
        age(&lock);
        std::fs::write(&breaker, "").unwrap();
        assert!(!break_stale(&lock, "resource/r1").await.unwrap());
        assert!(lock.exists());
        assert!(breaker.exists());

        // An abandoned breaker is cleared for the next attempt.
        age(&breaker);
        assert!(!break_stale(&lock, "resource/r1").await.unwrap());
        assert!(!breaker.exists());
        assert!(break_stale(&lock, "resource/r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_two_handles_share_state() {
        let dir = tempdir().expect("Failed to create temp dir");
        let first = FileStore::open(dir.path()).expect("Failed to open store");
        let second = FileStore::open(dir.path()).expect("Failed to open store");

        first.put("resource/r1", "payload".to_string()).await.unwrap();
        let seen = second.get("resource/r1").await.unwrap().unwrap();
        assert_eq!(seen.value, "payload");
    }

    #[tokio::test]
    async fn test_concurrent_claim_has_one_winner() {
        let dir = tempdir().expect("Failed to create temp dir");
        let store = Arc::new(FileStore::open(dir.path()).expect("Failed to open store"));
        let version = store.put("queue/job", "job".to_string()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.compare_and_delete("queue/job", version).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
