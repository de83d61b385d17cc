//! Job Queue.
//!
//! Both queue types take a serializable [`JobDescriptor`] and guarantee that
//! exactly one worker executes it. The resource record moves from
//! `accepted` to `running` when a worker claims the job, never before.
//!
//! - [`LocalQueue`]: bounded task pool inside the submitting process
//! - [`DistributedQueue`]: descriptors are written under `queue/` in the
//!   shared store and consumed by [`QueueWorker`]s in other processes

pub mod dispatch;
pub mod distributed;
pub mod local;
pub mod worker;

pub use dispatch::run_job;
pub use distributed::DistributedQueue;
pub use local::LocalQueue;
pub use worker::QueueWorker;

use crate::store::StoreError;
use async_trait::async_trait;
use gp_protocol::{JobDescriptor, QueueKind};
use thiserror::Error;

pub(crate) const QUEUE_PREFIX: &str = "queue/";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to encode job {resource_id}: {source}")]
    Encode {
        resource_id: String,
        source: serde_json::Error,
    },

    #[error("Job {0} is already queued")]
    Duplicate(String),

    #[error("Queue is shut down")]
    Closed,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: JobDescriptor) -> Result<(), QueueError>;

    fn kind(&self) -> QueueKind;
}
