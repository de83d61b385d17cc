//! Workspace Lock Manager.
//!
//! Locks live in the shared store under `lock/<location>/<mapset>` as a
//! [`LockState`]. Every change is a read-modify-write guarded by
//! compare-and-swap, so concurrent acquirers in different workers see a
//! consistent holder set.
//!
//! Acquisition never waits: an exclusive acquire fails with
//! [`LockError::Busy`] while any unexpired holder exists, a shared acquire
//! only while an unexpired exclusive holder exists. Holders whose TTL has
//! elapsed are pruned on the next acquire against the same workspace. A slow
//! but alive holder that misses its refresh can therefore lose its lock; the
//! refresh after each step keeps this window at one TTL.

use crate::store::{KeyValueStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on compare-and-swap retries under write contention.
const MAX_CAS_ATTEMPTS: usize = 32;

#[derive(Error, Debug)]
pub enum LockError {
    /// The workspace is held by another resource.
    #[error("Workspace '{workspace_id}' is locked by {holder}")]
    Busy {
        workspace_id: String,
        holder: String,
    },

    /// The lock expired and was reclaimed by someone else.
    #[error("Lock {lock_id} on workspace '{workspace_id}' is no longer held")]
    Lost {
        workspace_id: String,
        lock_id: String,
    },

    #[error("Corrupt lock state for workspace '{workspace_id}': {reason}")]
    Corrupt {
        workspace_id: String,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type LockResult<T> = Result<T, LockError>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// One holder entry of a workspace lock.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub resource_id: String,
    pub lock_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockHolder {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Persisted lock state of one workspace.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct LockState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive: Option<LockHolder>,

    #[serde(default)]
    pub shared: Vec<LockHolder>,
}

impl LockState {
    /// Drop every holder whose TTL has elapsed. Returns the pruned holders.
    fn prune(&mut self, now: DateTime<Utc>) -> Vec<LockHolder> {
        let mut pruned = Vec::new();
        if self.exclusive.as_ref().is_some_and(|h| h.is_expired(now)) {
            pruned.extend(self.exclusive.take());
        }
        let (expired, live): (Vec<_>, Vec<_>) =
            self.shared.drain(..).partition(|h| h.is_expired(now));
        self.shared = live;
        pruned.extend(expired);
        pruned
    }

    fn holder_mut(&mut self, lock_id: &str) -> Option<&mut LockHolder> {
        if let Some(holder) = self.exclusive.as_mut().filter(|h| h.lock_id == lock_id) {
            return Some(holder);
        }
        self.shared.iter_mut().find(|h| h.lock_id == lock_id)
    }

    fn remove(&mut self, lock_id: &str) -> bool {
        if self.exclusive.as_ref().is_some_and(|h| h.lock_id == lock_id) {
            self.exclusive = None;
            return true;
        }
        let before = self.shared.len();
        self.shared.retain(|h| h.lock_id != lock_id);
        self.shared.len() != before
    }

    pub fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

/// A granted lock. Carries identifiers only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLock {
    pub workspace_id: String,
    pub resource_id: String,
    pub lock_id: String,
    pub mode: LockMode,
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
}

fn lock_key(workspace_id: &str) -> String {
    format!("lock/{workspace_id}")
}

fn ttl_delta(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

impl LockManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    async fn load(&self, workspace_id: &str) -> LockResult<(Option<u64>, LockState)> {
        match self.store.get(&lock_key(workspace_id)).await? {
            Some(entry) => {
                let state =
                    serde_json::from_str(&entry.value).map_err(|e| LockError::Corrupt {
                        workspace_id: workspace_id.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok((Some(entry.version), state))
            }
            None => Ok((None, LockState::default())),
        }
    }

    async fn save(
        &self,
        workspace_id: &str,
        version: Option<u64>,
        state: &LockState,
    ) -> LockResult<bool> {
        let value = serde_json::to_string(state).map_err(StoreError::from)?;
        Ok(self
            .store
            .compare_and_swap(&lock_key(workspace_id), version, value)
            .await?)
    }

    /// Try to take a lock on `workspace_id` for `resource_id`. Never waits.
    pub async fn acquire(
        &self,
        workspace_id: &str,
        resource_id: &str,
        mode: LockMode,
        ttl: Duration,
    ) -> LockResult<WorkspaceLock> {
        let lock_id = uuid::Uuid::new_v4().to_string();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let (version, mut state) = self.load(workspace_id).await?;
            let now = Utc::now();

            for stale in state.prune(now) {
                tracing::warn!(
                    workspace_id,
                    stale_holder = %stale.resource_id,
                    expired_at = %stale.expires_at,
                    "Reclaiming expired workspace lock"
                );
            }

            let conflict = match mode {
                LockMode::Exclusive => state
                    .exclusive
                    .as_ref()
                    .or_else(|| state.shared.first()),
                LockMode::Shared => state.exclusive.as_ref(),
            };
            if let Some(holder) = conflict {
                tracing::info!(
                    workspace_id,
                    resource_id,
                    holder = %holder.resource_id,
                    "Workspace lock busy"
                );
                return Err(LockError::Busy {
                    workspace_id: workspace_id.to_string(),
                    holder: holder.resource_id.clone(),
                });
            }

            let expires_at = now + ttl_delta(ttl);
            let holder = LockHolder {
                resource_id: resource_id.to_string(),
                lock_id: lock_id.clone(),
                acquired_at: now,
                expires_at,
            };
            match mode {
                LockMode::Exclusive => state.exclusive = Some(holder),
                LockMode::Shared => state.shared.push(holder),
            }

            if self.save(workspace_id, version, &state).await? {
                tracing::debug!(workspace_id, resource_id, ?mode, "Workspace lock acquired");
                return Ok(WorkspaceLock {
                    workspace_id: workspace_id.to_string(),
                    resource_id: resource_id.to_string(),
                    lock_id,
                    mode,
                    ttl,
                    expires_at,
                });
            }
        }

        // Persistent write contention is indistinguishable from a busy lock
        // for the caller: retry later.
        Err(LockError::Busy {
            workspace_id: workspace_id.to_string(),
            holder: "concurrent acquirer".to_string(),
        })
    }

    /// Extend the lock by its TTL from now.
    ///
    /// Fails with [`LockError::Lost`] if the lock was reclaimed meanwhile.
    pub async fn refresh(&self, lock: &WorkspaceLock) -> LockResult<WorkspaceLock> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (version, mut state) = self.load(&lock.workspace_id).await?;
            let expires_at = Utc::now() + ttl_delta(lock.ttl);

            let Some(holder) = state.holder_mut(&lock.lock_id) else {
                return Err(LockError::Lost {
                    workspace_id: lock.workspace_id.clone(),
                    lock_id: lock.lock_id.clone(),
                });
            };
            holder.expires_at = expires_at;

            if self.save(&lock.workspace_id, version, &state).await? {
                return Ok(WorkspaceLock {
                    expires_at,
                    ..lock.clone()
                });
            }
        }

        Err(LockError::Lost {
            workspace_id: lock.workspace_id.clone(),
            lock_id: lock.lock_id.clone(),
        })
    }

    /// Give the lock up. Releasing a lock that is no longer held is a no-op.
    pub async fn release(&self, lock: &WorkspaceLock) -> LockResult<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (version, mut state) = self.load(&lock.workspace_id).await?;
            if !state.remove(&lock.lock_id) {
                tracing::debug!(
                    workspace_id = %lock.workspace_id,
                    lock_id = %lock.lock_id,
                    "Lock already gone on release"
                );
                return Ok(());
            }
            if self.save(&lock.workspace_id, version, &state).await? {
                tracing::debug!(workspace_id = %lock.workspace_id, "Workspace lock released");
                return Ok(());
            }
        }

        Err(LockError::Busy {
            workspace_id: lock.workspace_id.clone(),
            holder: "concurrent writer".to_string(),
        })
    }

    /// Current holders of a workspace, expired ones excluded.
    pub async fn inspect(&self, workspace_id: &str) -> LockResult<LockState> {
        let (_, mut state) = self.load(workspace_id).await?;
        state.prune(Utc::now());
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryStore::new()))
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_exclusive_blocks_exclusive_and_shared() {
        let locks = manager();
        let held = locks
            .acquire("loc/ms", "r1", LockMode::Exclusive, TTL)
            .await
            .unwrap();

        let err = locks
            .acquire("loc/ms", "r2", LockMode::Exclusive, TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Busy { ref holder, .. } if holder == "r1"));

        let err = locks
            .acquire("loc/ms", "r3", LockMode::Shared, TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Busy { .. }));

        locks.release(&held).await.unwrap();
        locks
            .acquire("loc/ms", "r2", LockMode::Exclusive, TTL)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shared_locks_coexist_but_block_exclusive() {
        let locks = manager();
        let a = locks
            .acquire("loc/ms", "r1", LockMode::Shared, TTL)
            .await
            .unwrap();
        let b = locks
            .acquire("loc/ms", "r2", LockMode::Shared, TTL)
            .await
            .unwrap();

        assert!(locks
            .acquire("loc/ms", "r3", LockMode::Exclusive, TTL)
            .await
            .is_err());

        locks.release(&a).await.unwrap();
        assert!(locks
            .acquire("loc/ms", "r3", LockMode::Exclusive, TTL)
            .await
            .is_err());

        locks.release(&b).await.unwrap();
        assert!(locks.inspect("loc/ms").await.unwrap().is_free());
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let locks = manager();
        let stale = locks
            .acquire("loc/ms", "crashed", LockMode::Exclusive, Duration::from_millis(50))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let fresh = locks
            .acquire("loc/ms", "r2", LockMode::Exclusive, TTL)
            .await
            .unwrap();
        assert_eq!(fresh.resource_id, "r2");

        let err = locks.refresh(&stale).await.unwrap_err();
        assert!(matches!(err, LockError::Lost { .. }));

        // Releasing the reclaimed lock must not drop the new holder.
        locks.release(&stale).await.unwrap();
        let state = locks.inspect("loc/ms").await.unwrap();
        assert_eq!(
            state.exclusive.map(|h| h.resource_id).as_deref(),
            Some("r2")
        );
    }

    #[tokio::test]
    async fn test_refresh_extends_expiry() {
        let locks = manager();
        let lock = locks
            .acquire("loc/ms", "r1", LockMode::Exclusive, Duration::from_millis(200))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let refreshed = locks.refresh(&lock).await.unwrap();
        assert!(refreshed.expires_at > lock.expires_at);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(locks
            .acquire("loc/ms", "r2", LockMode::Exclusive, TTL)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_distinct_workspaces_are_independent() {
        let locks = manager();
        locks
            .acquire("loc/a", "r1", LockMode::Exclusive, TTL)
            .await
            .unwrap();
        locks
            .acquire("loc/b", "r2", LockMode::Exclusive, TTL)
            .await
            .unwrap();
    }
}
