//! Resource Registry.
//!
//! One [`ResourceRecord`] per resource id, stored as JSON under
//! `resource/<resource_id>`. The registry is the only channel between the
//! request layer and workers. Every mutation is a compare-and-swap on the
//! whole record, so a poll always returns a complete record and concurrent
//! writers never lose each other's updates.

use crate::store::{KeyValueStore, StoreError};
use chrono::Utc;
use gp_protocol::{
    ErrorCode, ExceptionInfo, ProcessResults, Progress, ResourceRecord, ResourceStatus,
    RetentionConfig, StepLogEntry,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const RECORD_PREFIX: &str = "resource/";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Resource '{0}' not found")]
    NotFound(String),

    #[error("Resource '{0}' already exists")]
    AlreadyExists(String),

    #[error("Corrupt record for resource '{resource_id}': {reason}")]
    Corrupt { resource_id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A progress report from a running job.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub progress: Progress,
    pub log_entry: Option<StepLogEntry>,
    pub message: Option<String>,
}

/// The terminal state a job ends in.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: ResourceStatus,
    pub message: String,
    pub results: Option<ProcessResults>,
    pub exception: Option<ExceptionInfo>,
}

impl Outcome {
    pub fn finished(message: impl Into<String>, results: ProcessResults) -> Self {
        Self {
            status: ResourceStatus::Finished,
            message: message.into(),
            results: Some(results),
            exception: None,
        }
    }

    pub fn failed(exception: ExceptionInfo) -> Self {
        Self {
            status: ResourceStatus::Error,
            message: exception.message.clone(),
            results: None,
            exception: Some(exception),
        }
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: ResourceStatus::Terminated,
            message: message.clone(),
            results: None,
            exception: Some(ExceptionInfo {
                code: ErrorCode::Terminated,
                message,
                failed_step: None,
                retryable: true,
            }),
        }
    }
}

/// How long terminal records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_records: usize,
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            max_age: Duration::from_secs(config.max_age_secs),
            max_records: config.max_records,
        }
    }
}

#[derive(Clone)]
pub struct ResourceRegistry {
    store: Arc<dyn KeyValueStore>,
}

fn record_key(resource_id: &str) -> String {
    format!("{RECORD_PREFIX}{resource_id}")
}

impl ResourceRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn decode(resource_id: &str, value: &str) -> RegistryResult<ResourceRecord> {
        serde_json::from_str(value).map_err(|e| RegistryError::Corrupt {
            resource_id: resource_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Store a fresh record. Fails if the id is already taken.
    pub async fn create(&self, record: ResourceRecord) -> RegistryResult<ResourceRecord> {
        let value = serde_json::to_string(&record).map_err(StoreError::from)?;
        let created = self
            .store
            .compare_and_swap(&record_key(&record.resource_id), None, value)
            .await?;
        if !created {
            return Err(RegistryError::AlreadyExists(record.resource_id));
        }
        tracing::debug!(resource_id = %record.resource_id, "Resource record created");
        Ok(record)
    }

    pub async fn get(&self, resource_id: &str) -> RegistryResult<ResourceRecord> {
        match self.store.get(&record_key(resource_id)).await? {
            Some(entry) => Self::decode(resource_id, &entry.value),
            None => Err(RegistryError::NotFound(resource_id.to_string())),
        }
    }

    /// Read-modify-write loop. `change` returns `false` to leave the record
    /// untouched; the function then returns `None`.
    async fn modify<F>(&self, resource_id: &str, mut change: F) -> RegistryResult<Option<ResourceRecord>>
    where
        F: FnMut(&mut ResourceRecord) -> bool + Send,
    {
        let key = record_key(resource_id);
        loop {
            let entry = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| RegistryError::NotFound(resource_id.to_string()))?;
            let mut record = Self::decode(resource_id, &entry.value)?;

            if !change(&mut record) {
                return Ok(None);
            }
            record.updated_at = Utc::now();

            let value = serde_json::to_string(&record).map_err(StoreError::from)?;
            if self
                .store
                .compare_and_swap(&key, Some(entry.version), value)
                .await?
            {
                return Ok(Some(record));
            }
        }
    }

    /// `accepted -> running`. Returns `false` if the record was not in
    /// `accepted` state, i.e. another worker already claimed it.
    pub async fn mark_running(&self, resource_id: &str) -> RegistryResult<bool> {
        let updated = self
            .modify(resource_id, |record| {
                if record.status != ResourceStatus::Accepted {
                    return false;
                }
                record.status = ResourceStatus::Running;
                record.message = "Processing started".to_string();
                record.started_at = Some(Utc::now());
                true
            })
            .await?;
        Ok(updated.is_some())
    }

    /// Append a step log entry and advance progress. Progress never moves
    /// backwards and terminal records are left alone.
    pub async fn update(&self, resource_id: &str, update: StepUpdate) -> RegistryResult<bool> {
        let updated = self
            .modify(resource_id, |record| {
                if record.status.is_terminal() {
                    return false;
                }
                if update.progress.step >= record.progress.step {
                    record.progress.step = update.progress.step;
                }
                record.progress.num_of_steps =
                    record.progress.num_of_steps.max(update.progress.num_of_steps);
                if let Some(entry) = &update.log_entry {
                    record.process_log.push(entry.clone());
                }
                if let Some(message) = &update.message {
                    record.message = message.clone();
                }
                true
            })
            .await?;

        if updated.is_none() {
            tracing::warn!(resource_id, "Ignoring update of a terminal resource");
        }
        Ok(updated.is_some())
    }

    /// Move the record into its terminal state.
    ///
    /// A second finalize of a terminal record changes nothing and returns
    /// `false`.
    pub async fn finalize(&self, resource_id: &str, outcome: Outcome) -> RegistryResult<bool> {
        let mut existing = None;
        let updated = self
            .modify(resource_id, |record| {
                if record.status.is_terminal() {
                    existing = Some(record.status);
                    return false;
                }
                record.status = outcome.status;
                record.message = outcome.message.clone();
                record.process_results = outcome.results.clone();
                record.exception = outcome.exception.clone();
                if let Some(results) = &outcome.results {
                    record.urls.resources = results.exports.iter().map(|e| e.url.clone()).collect();
                }
                record.finished_at = Some(Utc::now());
                true
            })
            .await?;

        match updated {
            Some(record) => {
                tracing::info!(resource_id, status = ?record.status, "Resource finalized");
                Ok(true)
            }
            None => {
                tracing::warn!(
                    resource_id,
                    existing = ?existing,
                    attempted = ?outcome.status,
                    "Finalize on an already terminal resource ignored"
                );
                Ok(false)
            }
        }
    }

    pub async fn list(&self) -> RegistryResult<Vec<ResourceRecord>> {
        let mut records = Vec::new();
        for key in self.store.list(RECORD_PREFIX).await? {
            let resource_id = key.trim_start_matches(RECORD_PREFIX);
            // Entries may disappear between list and get.
            if let Some(entry) = self.store.get(&key).await? {
                records.push(Self::decode(resource_id, &entry.value)?);
            }
        }
        Ok(records)
    }

    pub async fn list_for_user(&self, user_id: &str) -> RegistryResult<Vec<ResourceRecord>> {
        let mut records = self.list().await?;
        records.retain(|record| record.user_id == user_id);
        records.sort_by_key(|record| record.accepted_at);
        Ok(records)
    }

    /// Remove terminal records older than `max_age`, then the oldest
    /// terminal records beyond `max_records`. Returns the evicted ids.
    pub async fn evict(&self, policy: RetentionPolicy) -> RegistryResult<Vec<String>> {
        let max_age = chrono::Duration::from_std(policy.max_age)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let cutoff = Utc::now() - max_age;

        let mut terminal: Vec<ResourceRecord> = self
            .list()
            .await?
            .into_iter()
            .filter(|record| record.status.is_terminal())
            .collect();
        terminal.sort_by_key(|record| record.finished_at.unwrap_or(record.updated_at));

        let mut doomed = Vec::new();
        let mut kept = Vec::new();
        for record in terminal {
            if record.finished_at.unwrap_or(record.updated_at) < cutoff {
                doomed.push(record.resource_id);
            } else {
                kept.push(record.resource_id);
            }
        }
        if kept.len() > policy.max_records {
            let overflow = kept.len() - policy.max_records;
            doomed.extend(kept.drain(..overflow));
        }

        let mut evicted = Vec::new();
        for resource_id in doomed {
            if self.store.delete(&record_key(&resource_id)).await? {
                tracing::info!(resource_id = %resource_id, "Resource record evicted");
                evicted.push(resource_id);
            }
        }
        Ok(evicted)
    }

    /// Finalize `running` records without an update for longer than
    /// `max_silence` as `terminated`. Returns the affected ids.
    pub async fn terminate_stale(&self, max_silence: Duration) -> RegistryResult<Vec<String>> {
        let silence = chrono::Duration::from_std(max_silence)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let cutoff = Utc::now() - silence;

        let mut terminated = Vec::new();
        for record in self.list().await? {
            if record.status != ResourceStatus::Running || record.updated_at >= cutoff {
                continue;
            }
            let outcome = Outcome::terminated(format!(
                "No progress reported since {}, worker presumed lost",
                record.updated_at
            ));
            if self.finalize(&record.resource_id, outcome).await? {
                tracing::warn!(resource_id = %record.resource_id, "Stale resource terminated");
                terminated.push(record.resource_id);
            }
        }
        Ok(terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use gp_protocol::{ApiInfo, ResourceUrls};

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn record(resource_id: &str, user_id: &str) -> ResourceRecord {
        ResourceRecord::accepted(
            resource_id,
            user_id,
            ResourceUrls::default(),
            ApiInfo::default(),
            Utc::now(),
        )
    }

    fn entry(id: &str) -> StepLogEntry {
        StepLogEntry {
            id: id.to_string(),
            executable: "r.info".to_string(),
            parameters: vec![],
            return_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            run_time: 0.1,
            timed_out: false,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_ids() {
        let registry = registry();
        registry.create(record("r1", "alice")).await.unwrap();
        let err = registry.create(record("r1", "alice")).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let err = registry().get("missing").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_running_only_once() {
        let registry = registry();
        registry.create(record("r1", "alice")).await.unwrap();
        assert!(registry.mark_running("r1").await.unwrap());
        assert!(!registry.mark_running("r1").await.unwrap());

        let current = registry.get("r1").await.unwrap();
        assert_eq!(current.status, ResourceStatus::Running);
        assert!(current.started_at.is_some());
    }

    #[tokio::test]
    async fn test_update_appends_and_progress_is_monotonic() {
        let registry = registry();
        registry.create(record("r1", "alice")).await.unwrap();
        registry.mark_running("r1").await.unwrap();

        let step = |n| StepUpdate {
            progress: Progress {
                step: n,
                num_of_steps: 3,
            },
            log_entry: Some(entry(&n.to_string())),
            message: None,
        };
        registry.update("r1", step(1)).await.unwrap();
        registry.update("r1", step(2)).await.unwrap();
        registry.update("r1", step(1)).await.unwrap();

        let current = registry.get("r1").await.unwrap();
        assert_eq!(current.progress.step, 2);
        assert_eq!(current.process_log.len(), 3);
        assert_eq!(current.process_log[1].id, "2");
    }

    #[tokio::test]
    async fn test_second_finalize_is_a_noop() {
        let registry = registry();
        registry.create(record("r1", "alice")).await.unwrap();
        registry.mark_running("r1").await.unwrap();

        let first = registry
            .finalize("r1", Outcome::finished("done", ProcessResults::default()))
            .await
            .unwrap();
        assert!(first);
        let before = registry.get("r1").await.unwrap();

        let second = registry
            .finalize(
                "r1",
                Outcome::failed(ExceptionInfo {
                    code: ErrorCode::InternalError,
                    message: "late failure".to_string(),
                    failed_step: None,
                    retryable: false,
                }),
            )
            .await
            .unwrap();
        assert!(!second);

        let after = registry.get("r1").await.unwrap();
        assert_eq!(after.status, ResourceStatus::Finished);
        assert_eq!(after.process_results, before.process_results);
        assert_eq!(after.process_log, before.process_log);
        assert_eq!(after.updated_at, before.updated_at);
        assert!(after.exception.is_none());

        // Updates after the terminal transition are ignored as well.
        let step = StepUpdate {
            progress: Progress::default(),
            log_entry: Some(entry("9")),
            message: None,
        };
        assert!(!registry.update("r1", step).await.unwrap());
    }

    #[tokio::test]
    async fn test_evict_keeps_running_and_honours_max_records() {
        let registry = registry();
        for id in ["r1", "r2", "r3"] {
            registry.create(record(id, "alice")).await.unwrap();
            registry.mark_running(id).await.unwrap();
            registry
                .finalize(id, Outcome::finished("done", ProcessResults::default()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry.create(record("r4", "alice")).await.unwrap();
        registry.mark_running("r4").await.unwrap();

        let evicted = registry
            .evict(RetentionPolicy {
                max_age: Duration::from_secs(3600),
                max_records: 1,
            })
            .await
            .unwrap();
        assert_eq!(evicted, vec!["r1", "r2"]);

        let remaining: Vec<_> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.resource_id)
            .collect();
        assert_eq!(remaining, vec!["r3", "r4"]);
    }

    #[tokio::test]
    async fn test_terminate_stale_running_records() {
        let registry = registry();
        registry.create(record("r1", "alice")).await.unwrap();
        registry.mark_running("r1").await.unwrap();
        registry.create(record("r2", "alice")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let terminated = registry
            .terminate_stale(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(terminated, vec!["r1"]);

        let current = registry.get("r1").await.unwrap();
        assert_eq!(current.status, ResourceStatus::Terminated);
        assert_eq!(
            current.exception.map(|e| e.code),
            Some(ErrorCode::Terminated)
        );
        assert_eq!(
            registry.get("r2").await.unwrap().status,
            ResourceStatus::Accepted
        );
    }
}
