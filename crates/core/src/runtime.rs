//! Wiring of every engine component from an [`AppConfig`].

use crate::config::AppConfig;
use crate::engine::WorkerServices;
use crate::lock::LockManager;
use crate::queue::{DistributedQueue, JobQueue, LocalQueue, QueueWorker};
use crate::registry::ResourceRegistry;
use crate::runner::{SubprocessRunner, ToolRunner};
use crate::service::ProcessingService;
use crate::storage::FileSystemStorage;
use crate::store::{FileStore, KeyValueStore, MemoryStore};
use crate::workspace::WorkspaceManager;
use anyhow::{Context, Result};
use gp_protocol::{QueueKind, StoreConfig};
use std::sync::Arc;
use std::time::Duration;

pub struct Runtime {
    config: AppConfig,
    store: Arc<dyn KeyValueStore>,
    services: WorkerServices,
    queue: Arc<dyn JobQueue>,
    local: Option<Arc<LocalQueue>>,
}

impl Runtime {
    /// Build with the real subprocess runner.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let runner = SubprocessRunner::new(config.engine.workspace.tool_path.clone());
        Self::build(config, Arc::new(runner))
    }

    pub fn build(config: AppConfig, runner: Arc<dyn ToolRunner>) -> Result<Self> {
        let engine = &config.engine;

        let store: Arc<dyn KeyValueStore> = match &engine.queue.store {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::Filesystem { path } => Arc::new(
                FileStore::open(path)
                    .with_context(|| format!("opening store at {}", path.display()))?,
            ),
        };

        if engine.queue.kind == QueueKind::Distributed
            && matches!(engine.queue.store, StoreConfig::Memory)
        {
            tracing::warn!("Distributed queue on an in-memory store only reaches workers in this process");
        }

        let services = WorkerServices {
            registry: ResourceRegistry::new(Arc::clone(&store)),
            locks: LockManager::new(Arc::clone(&store)),
            runner,
            workspaces: Arc::new(WorkspaceManager::new(
                &engine.workspace.database,
                engine.workspace.temp_dir.clone(),
            )),
            storage: Arc::new(FileSystemStorage::new(
                &engine.storage.root,
                engine.storage.base_url.clone(),
            )),
        };

        let mut local = None;
        let queue: Arc<dyn JobQueue> = match engine.queue.kind {
            QueueKind::Local => {
                let pool = Arc::new(LocalQueue::new(services.clone(), engine.queue.workers));
                local = Some(Arc::clone(&pool));
                pool
            }
            QueueKind::Distributed => Arc::new(DistributedQueue::new(Arc::clone(&store))),
        };

        tracing::debug!(
            queue = ?engine.queue.kind,
            database = %engine.workspace.database.display(),
            "Runtime assembled"
        );

        Ok(Self {
            config,
            store,
            services,
            queue,
            local,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn services(&self) -> &WorkerServices {
        &self.services
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.queue.kind()
    }

    pub fn service(&self) -> ProcessingService {
        ProcessingService::new(
            Arc::new(self.config.engine.clone()),
            Arc::new(self.config.users.clone()),
            self.services.registry.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.services.workspaces),
            Arc::clone(&self.services.storage),
        )
    }

    /// A consumer for the distributed queue, sharing this runtime's store.
    pub fn worker(&self, concurrency: Option<usize>) -> QueueWorker {
        QueueWorker::new(
            Arc::clone(&self.store),
            self.services.clone(),
            concurrency.unwrap_or(self.config.engine.queue.workers),
            Duration::from_millis(self.config.engine.queue.poll_interval_ms),
        )
    }

    /// Wait for locally queued jobs to finish.
    pub async fn shutdown(&self) {
        if let Some(local) = &self.local {
            local.shutdown().await;
        }
    }
}
