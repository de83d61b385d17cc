//! Processing service.
//!
//! The request-facing side of the engine. Handlers validate, create the
//! `accepted` record and enqueue; they never run steps themselves. The
//! synchronous variant polls the registry until the record is terminal or
//! the job timeout elapses, then returns whatever state it saw last.

use crate::chain::{ProcessChainValidator, TemplateRegistry, ValidationError, ValidationOptions};
use crate::engine::INTERNAL_ERROR_MESSAGE;
use crate::queue::{JobQueue, QueueError};
use crate::registry::{Outcome, RegistryError, ResourceRegistry, RetentionPolicy};
use crate::storage::ResourceStorage;
use crate::workspace::WorkspaceManager;
use async_stream::try_stream;
use chrono::Utc;
use gp_protocol::{
    ApiInfo, EngineConfig, EngineSettings, ErrorCode, ExceptionInfo, ExecutionContext,
    HandlerKind, JobDescriptor, ProcessChain, RequestPayload, ResourceRecord, ResourceStatus,
    ResourceUrls, StorageBackend, StorageHandle, SubmitResponse, UserProfile, WorkspaceTarget,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::{Stream, StreamExt};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Unknown user '{0}'")]
    UnknownUser(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ServiceError {
    /// HTTP status a request layer answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Validation(_) => 400,
            ServiceError::UnknownUser(_) => 401,
            ServiceError::Registry(RegistryError::NotFound(_)) => 404,
            ServiceError::Registry(_) | ServiceError::Queue(_) => 500,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// One inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub user_id: String,
    pub location: String,
    /// Persistent target mapset; `None` runs ephemerally.
    pub mapset: Option<String>,
    /// Export declared outputs to storage.
    pub export: bool,
    pub payload: RequestPayload,
    pub api_info: ApiInfo,
}

#[derive(Clone)]
pub struct ProcessingService {
    config: Arc<EngineConfig>,
    users: Arc<BTreeMap<String, UserProfile>>,
    registry: ResourceRegistry,
    queue: Arc<dyn JobQueue>,
    workspaces: Arc<WorkspaceManager>,
    storage: Arc<dyn ResourceStorage>,
    templates: Arc<TemplateRegistry>,
}

impl ProcessingService {
    pub fn new(
        config: Arc<EngineConfig>,
        users: Arc<BTreeMap<String, UserProfile>>,
        registry: ResourceRegistry,
        queue: Arc<dyn JobQueue>,
        workspaces: Arc<WorkspaceManager>,
        storage: Arc<dyn ResourceStorage>,
    ) -> Self {
        Self {
            config,
            users,
            registry,
            queue,
            workspaces,
            storage,
            templates: Arc::new(TemplateRegistry::builtin()),
        }
    }

    fn context(&self, request: &SubmitRequest) -> ServiceResult<ExecutionContext> {
        let profile = self
            .users
            .get(&request.user_id)
            .ok_or_else(|| ServiceError::UnknownUser(request.user_id.clone()))?;

        Ok(ExecutionContext {
            resource_id: format!("resource_id-{}", uuid::Uuid::new_v4()),
            identity: profile.identity.clone(),
            quota: profile.quota.clone(),
            permissions: profile.permissions.clone(),
            workspace: WorkspaceTarget {
                location: request.location.clone(),
                mapset: request.mapset.clone(),
            },
            payload: request.payload.clone(),
            storage: StorageHandle {
                backend: StorageBackend::Filesystem,
                namespace: profile.identity.user_id.clone(),
            },
            api_info: request.api_info.clone(),
            settings: EngineSettings {
                lock_ttl_secs: self.config.locks.ttl_secs,
                status_base_url: self.config.service.status_base_url.clone(),
                export: self.config.export.clone(),
            },
            accepted_at: Utc::now(),
        })
    }

    fn build_chain(&self, context: &ExecutionContext) -> Result<ProcessChain, ValidationError> {
        let validator = ProcessChainValidator::new(self.workspaces.as_ref());
        match &context.payload {
            RequestPayload::ProcessChain(description) => {
                validator.validate(description, context, ValidationOptions::default())
            }
            RequestPayload::Custom { template, data } => {
                let description = self.templates.build(template, data)?;
                validator.validate(
                    &description,
                    context,
                    ValidationOptions {
                        skip_permission_check: true,
                    },
                )
            }
        }
    }

    /// Validate without creating a resource.
    pub fn validate(&self, request: &SubmitRequest) -> ServiceResult<ProcessChain> {
        let context = self.context(request)?;
        Ok(self.build_chain(&context)?)
    }

    /// Validate, record and enqueue. Answers as soon as the job is accepted.
    pub async fn submit(&self, request: SubmitRequest) -> ServiceResult<SubmitResponse> {
        let context = self.context(&request)?;
        let chain = match self.build_chain(&context) {
            Ok(chain) => chain,
            Err(e) => {
                tracing::info!(user_id = %request.user_id, error = %e, "Request rejected");
                return Err(e.into());
            }
        };

        let resource_id = context.resource_id.clone();
        let urls = ResourceUrls {
            status: format!(
                "{}/{}/{resource_id}",
                context.settings.status_base_url.trim_end_matches('/'),
                context.user_id()
            ),
            resources: Vec::new(),
        };
        let record = ResourceRecord::accepted(
            &resource_id,
            context.user_id(),
            urls.clone(),
            context.api_info.clone(),
            context.accepted_at,
        );
        self.registry.create(record).await?;

        let handler = HandlerKind::select(context.is_persistent(), request.export);
        let job = JobDescriptor {
            resource_id: resource_id.clone(),
            handler,
            timeout_secs: self.config.service.job_timeout_secs,
            enqueued_at: Utc::now(),
            context,
            chain,
        };

        if let Err(e) = self.queue.enqueue(job).await {
            tracing::error!(resource_id = %resource_id, error = %e, "Failed to enqueue job");
            let outcome = Outcome::failed(ExceptionInfo {
                code: ErrorCode::InternalError,
                message: INTERNAL_ERROR_MESSAGE.to_string(),
                failed_step: None,
                retryable: true,
            });
            self.registry.finalize(&resource_id, outcome).await?;
            return Err(e.into());
        }

        tracing::info!(resource_id = %resource_id, handler = %handler, queue = ?self.queue.kind(), "Resource accepted");
        Ok(SubmitResponse {
            resource_id,
            status: ResourceStatus::Accepted,
            urls,
        })
    }

    /// Submit and block until the record is terminal or the job timeout
    /// elapses.
    pub async fn submit_and_wait(&self, request: SubmitRequest) -> ServiceResult<ResourceRecord> {
        let response = self.submit(request).await?;
        self.wait(
            &response.resource_id,
            Duration::from_secs(self.config.service.job_timeout_secs),
        )
        .await
    }

    /// Successive states of a record, ending with the first terminal one.
    pub fn watch(
        &self,
        resource_id: &str,
    ) -> impl Stream<Item = Result<ResourceRecord, RegistryError>> + Send + 'static {
        let registry = self.registry.clone();
        let resource_id = resource_id.to_string();
        let interval = Duration::from_millis(self.config.service.poll_interval_ms.max(1));

        try_stream! {
            loop {
                let record = registry.get(&resource_id).await?;
                let done = record.status.is_terminal();
                yield record;
                if done {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        }
    }

    /// Poll until terminal. On timeout the last seen, still running record
    /// is returned.
    pub async fn wait(&self, resource_id: &str, timeout: Duration) -> ServiceResult<ResourceRecord> {
        let updates = self.watch(resource_id);
        tokio::pin!(updates);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut latest = None;
        loop {
            tokio::select! {
                update = updates.next() => match update {
                    Some(Ok(record)) => {
                        if record.status.is_terminal() {
                            return Ok(record);
                        }
                        latest = Some(record);
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
                _ = &mut deadline => {
                    tracing::debug!(resource_id, "Wait timed out, returning current state");
                    break;
                }
            }
        }

        match latest {
            Some(record) => Ok(record),
            None => Ok(self.registry.get(resource_id).await?),
        }
    }

    pub async fn status(&self, resource_id: &str) -> ServiceResult<ResourceRecord> {
        Ok(self.registry.get(resource_id).await?)
    }

    pub async fn list_for_user(&self, user_id: &str) -> ServiceResult<Vec<ResourceRecord>> {
        Ok(self.registry.list_for_user(user_id).await?)
    }

    /// Apply the retention policy and remove exports of evicted resources.
    pub async fn evict(&self) -> ServiceResult<Vec<String>> {
        let policy = RetentionPolicy::from(&self.config.retention);
        let evicted = self.registry.evict(policy).await?;
        for resource_id in &evicted {
            if let Err(e) = self.storage.remove(resource_id).await {
                tracing::warn!(resource_id = %resource_id, error = %e, "Failed to remove exports of evicted resource");
            }
        }
        Ok(evicted)
    }

    pub async fn terminate_stale(&self, max_silence: Duration) -> ServiceResult<Vec<String>> {
        Ok(self.registry.terminate_stale(max_silence).await?)
    }
}
