//! Consumer side of the distributed queue.

use super::distributed::resource_id_of;
use super::{run_job, QueueError, QUEUE_PREFIX};
use crate::engine::{WorkerServices, INTERNAL_ERROR_MESSAGE};
use crate::registry::Outcome;
use crate::store::KeyValueStore;
use gp_protocol::{ErrorCode, ExceptionInfo, JobDescriptor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct QueueWorker {
    store: Arc<dyn KeyValueStore>,
    services: WorkerServices,
    concurrency: usize,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        services: WorkerServices,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            services,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Claim and execute jobs until `shutdown` is cancelled, then wait for
    /// the jobs still in flight.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), QueueError> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let tracker = TaskTracker::new();
        tracing::info!(concurrency = self.concurrency, "Queue worker started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim_next().await {
                Ok(Some(job)) => {
                    let services = self.services.clone();
                    tracker.spawn(async move {
                        run_job(services, job).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    tracing::warn!(error = %e, "Failed to poll the job queue");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracker.close();
        tracing::info!(in_flight = tracker.len(), "Queue worker stopping");
        tracker.wait().await;
        Ok(())
    }

    /// Take the oldest queue entry. Deletion is conditional on the version
    /// that was read, so concurrent workers never claim the same entry.
    pub async fn claim_next(&self) -> Result<Option<JobDescriptor>, QueueError> {
        for key in self.store.list(QUEUE_PREFIX).await? {
            let Some(entry) = self.store.get(&key).await? else {
                continue;
            };
            if !self.store.compare_and_delete(&key, entry.version).await? {
                continue;
            }

            match serde_json::from_str::<JobDescriptor>(&entry.value) {
                Ok(job) => {
                    tracing::debug!(resource_id = %job.resource_id, "Claimed job");
                    return Ok(Some(job));
                }
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Dropping undecodable queue entry");
                    self.fail_undecodable(&key).await;
                }
            }
        }
        Ok(None)
    }

    async fn fail_undecodable(&self, key: &str) {
        let Some(resource_id) = resource_id_of(key) else {
            return;
        };
        let outcome = Outcome::failed(ExceptionInfo {
            code: ErrorCode::InternalError,
            message: INTERNAL_ERROR_MESSAGE.to_string(),
            failed_step: None,
            retryable: false,
        });
        if let Err(e) = self.services.registry.finalize(resource_id, outcome).await {
            tracing::debug!(resource_id, error = %e, "No record to fail for dropped entry");
        }
    }
}
