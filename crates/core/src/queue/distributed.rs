use super::{JobQueue, QueueError, QUEUE_PREFIX};
use crate::store::KeyValueStore;
use async_trait::async_trait;
use gp_protocol::{JobDescriptor, QueueKind};
use std::sync::Arc;

/// Producer side of the distributed queue.
///
/// Entries are keyed `queue/<enqueued millis, zero padded>-<resource id>` so
/// a prefix listing yields them in submission order.
#[derive(Clone)]
pub struct DistributedQueue {
    store: Arc<dyn KeyValueStore>,
}

pub(crate) fn entry_key(job: &JobDescriptor) -> String {
    let millis = job.enqueued_at.timestamp_millis().max(0);
    format!("{QUEUE_PREFIX}{millis:020}-{}", job.resource_id)
}

/// Resource id encoded in a queue key.
pub(crate) fn resource_id_of(key: &str) -> Option<&str> {
    key.strip_prefix(QUEUE_PREFIX)?
        .split_once('-')
        .map(|(_, resource_id)| resource_id)
}

impl DistributedQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Number of entries waiting to be claimed.
    pub async fn pending(&self) -> Result<usize, QueueError> {
        Ok(self.store.list(QUEUE_PREFIX).await?.len())
    }
}

#[async_trait]
impl JobQueue for DistributedQueue {
    async fn enqueue(&self, job: JobDescriptor) -> Result<(), QueueError> {
        let key = entry_key(&job);
        let value = serde_json::to_string(&job).map_err(|source| QueueError::Encode {
            resource_id: job.resource_id.clone(),
            source,
        })?;

        if !self.store.compare_and_swap(&key, None, value).await? {
            return Err(QueueError::Duplicate(job.resource_id));
        }
        tracing::debug!(resource_id = %job.resource_id, key = %key, "Job published");
        Ok(())
    }

    fn kind(&self) -> QueueKind {
        QueueKind::Distributed
    }
}
