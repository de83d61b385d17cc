use super::{run_job, JobQueue, QueueError};
use crate::engine::WorkerServices;
use async_trait::async_trait;
use gp_protocol::{JobDescriptor, QueueKind};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

/// Runs jobs in this process, at most `workers` at a time.
pub struct LocalQueue {
    services: WorkerServices,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl LocalQueue {
    pub fn new(services: WorkerServices, workers: usize) -> Self {
        Self {
            services,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Stop accepting jobs and wait for queued and running ones.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn enqueue(&self, job: JobDescriptor) -> Result<(), QueueError> {
        if self.tracker.is_closed() {
            return Err(QueueError::Closed);
        }

        let permits = Arc::clone(&self.permits);
        let services = self.services.clone();
        tracing::debug!(resource_id = %job.resource_id, handler = %job.handler, "Job queued locally");
        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            run_job(services, job).await;
        });
        Ok(())
    }

    fn kind(&self) -> QueueKind {
        QueueKind::Local
    }
}
