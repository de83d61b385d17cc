//! Processing strategies.
//!
//! A [`ProcessingJob`] supplies the variant-specific parts of a run: how the
//! workspace is materialized, what happens between steps, how results are
//! finished and what cleanup is owed. The step loop itself lives in
//! [`super::machine::ProcessingMachine`] and is the same for every variant.

use super::error::ProcessingError;
use crate::chain::{referenced_mapsets, ProcessChainValidator};
use crate::lock::{LockManager, LockMode, WorkspaceLock};
use crate::registry::ResourceRegistry;
use crate::runner::ToolRunner;
use crate::storage::{ResourceStorage, StorageError};
use crate::workspace::{Workspace, WorkspaceEnv, WorkspaceError, WorkspaceManager};
use async_trait::async_trait;
use gp_protocol::{
    Executable, ExecutionContext, ExportKind, ExportedResource, HandlerKind, ProcessChain,
    ProcessModel, ProcessParam, ProcessResults,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Live collaborators of a worker. Resolved on the worker side, never
/// serialized.
#[derive(Clone)]
pub struct WorkerServices {
    pub registry: ResourceRegistry,
    pub locks: LockManager,
    pub runner: Arc<dyn ToolRunner>,
    pub workspaces: Arc<WorkspaceManager>,
    pub storage: Arc<dyn ResourceStorage>,
}

/// One claimed job.
pub struct JobRun {
    pub resource_id: String,
    pub context: ExecutionContext,
    pub chain: ProcessChain,
    /// Overall job limit, counted from the claim.
    pub job_timeout: Duration,
    pub deadline: Instant,
    pub services: WorkerServices,
}

#[async_trait]
pub trait ProcessingJob: Send {
    fn handler(&self) -> HandlerKind;

    /// Materialize the workspace the steps run in.
    async fn create_environment(&mut self, run: &JobRun) -> Result<WorkspaceEnv, ProcessingError>;

    /// Append engine synthesized steps to the validated chain.
    fn extend_chain(
        &mut self,
        chain: ProcessChain,
        _env: &WorkspaceEnv,
        _run: &JobRun,
    ) -> Result<ProcessChain, ProcessingError> {
        Ok(chain)
    }

    async fn after_step(&mut self, _run: &JobRun) -> Result<(), ProcessingError> {
        Ok(())
    }

    /// Complete the result payload once every step succeeded.
    async fn finish(
        &mut self,
        _results: &mut ProcessResults,
        _run: &JobRun,
    ) -> Result<(), ProcessingError> {
        Ok(())
    }

    /// Runs on every exit path. Must not fail.
    async fn final_cleanup(&mut self, run: &JobRun);
}

async fn discard_workspace(workspace: Option<Workspace>, run: &JobRun) {
    if let Some(workspace) = workspace {
        if let Err(e) = workspace.cleanup().await {
            tracing::warn!(resource_id = %run.resource_id, error = %e, "Failed to remove temporary workspace");
        }
    }
}

async fn blocking<T, F>(task: F) -> Result<T, ProcessingError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, WorkspaceError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| ProcessingError::Internal(format!("workspace task failed: {e}")))?
        .map_err(ProcessingError::from)
}

/// Runs in a disposable copy of the location and never touches persistent
/// mapsets.
#[derive(Default)]
pub struct EphemeralJob {
    workspace: Option<Workspace>,
}

#[async_trait]
impl ProcessingJob for EphemeralJob {
    fn handler(&self) -> HandlerKind {
        HandlerKind::EphemeralProcessing
    }

    async fn create_environment(&mut self, run: &JobRun) -> Result<WorkspaceEnv, ProcessingError> {
        let workspaces = Arc::clone(&run.services.workspaces);
        let location = run.context.workspace.location.clone();
        let sources = referenced_mapsets(&run.chain);

        let workspace = blocking(move || workspaces.create_ephemeral(&location, &sources)).await?;
        let env = workspace.env.clone();
        self.workspace = Some(workspace);
        Ok(env)
    }

    async fn final_cleanup(&mut self, run: &JobRun) {
        discard_workspace(self.workspace.take(), run).await;
    }
}

/// Runs against a named mapset under an exclusive lock.
#[derive(Default)]
pub struct PersistentJob {
    workspace: Option<Workspace>,
    lock: Option<WorkspaceLock>,
}

#[async_trait]
impl ProcessingJob for PersistentJob {
    fn handler(&self) -> HandlerKind {
        HandlerKind::PersistentProcessing
    }

    async fn create_environment(&mut self, run: &JobRun) -> Result<WorkspaceEnv, ProcessingError> {
        let target = &run.context.workspace;
        let (Some(workspace_id), Some(mapset)) = (target.workspace_id(), target.mapset.clone())
        else {
            return Err(ProcessingError::Internal(
                "persistent job without a target mapset".to_string(),
            ));
        };

        let ttl = Duration::from_secs(run.context.settings.lock_ttl_secs);
        let lock = run
            .services
            .locks
            .acquire(&workspace_id, &run.resource_id, LockMode::Exclusive, ttl)
            .await?;
        tracing::debug!(workspace_id = %workspace_id, lock_id = %lock.lock_id, "Workspace lock acquired");
        self.lock = Some(lock);

        // Another user may have created the mapset since validation.
        ProcessChainValidator::new(run.services.workspaces.as_ref())
            .check_target_mapset(&run.context)?;

        let workspaces = Arc::clone(&run.services.workspaces);
        let location = target.location.clone();
        let owner = run.context.user_id().to_string();
        let workspace =
            blocking(move || workspaces.open_persistent(&location, &mapset, &owner)).await?;
        let env = workspace.env.clone();
        self.workspace = Some(workspace);
        Ok(env)
    }

    async fn after_step(&mut self, run: &JobRun) -> Result<(), ProcessingError> {
        if let Some(lock) = &self.lock {
            let refreshed = run.services.locks.refresh(lock).await?;
            self.lock = Some(refreshed);
        }
        Ok(())
    }

    async fn final_cleanup(&mut self, run: &JobRun) {
        discard_workspace(self.workspace.take(), run).await;
        if let Some(lock) = self.lock.take() {
            match run.services.locks.release(&lock).await {
                Ok(()) => {
                    tracing::debug!(workspace_id = %lock.workspace_id, "Workspace lock released")
                }
                Err(e) => {
                    tracing::warn!(workspace_id = %lock.workspace_id, error = %e, "Failed to release workspace lock; it expires with its TTL")
                }
            }
        }
    }
}

/// A file an export step will leave behind.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingExport {
    name: String,
    kind: ExportKind,
    format: String,
    path: PathBuf,
    /// Directory the file has to stay in.
    base: PathBuf,
}

/// Resolve links and `..` in `path`, failing when it leaves `base`.
async fn contained(path: &Path, base: &Path) -> Result<PathBuf, StorageError> {
    let resolved = tokio::fs::canonicalize(path)
        .await
        .map_err(|_| StorageError::MissingFile(path.to_path_buf()))?;
    let base = tokio::fs::canonicalize(base)
        .await
        .map_err(|source| StorageError::Io {
            path: base.to_path_buf(),
            source,
        })?;
    if resolved.starts_with(&base) && resolved != base {
        Ok(resolved)
    } else {
        Err(StorageError::OutsideWorkspace(path.to_path_buf()))
    }
}

fn file_extension(format: &str) -> String {
    match format.to_ascii_lowercase().as_str() {
        "gtiff" | "cog" => "tif".to_string(),
        "esri_shapefile" | "esri shapefile" => "shp".to_string(),
        "geojson" => "geojson".to_string(),
        "gpkg" => "gpkg".to_string(),
        "csv" => "csv".to_string(),
        other => other.replace(' ', "_"),
    }
}

/// Adds one export step per declared output and hands the files to storage
/// once the chain has finished.
pub struct ExportJob<J> {
    inner: J,
    pending: Vec<PendingExport>,
}

impl<J: ProcessingJob> ExportJob<J> {
    pub fn new(inner: J) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    /// Register the export of `output`, returning the step that writes the
    /// file. Plain files are picked up from the mapset and need no step.
    fn export_step(
        &mut self,
        id: usize,
        output: &ProcessParam,
        (kind, format): (ExportKind, &str),
        run: &JobRun,
        env: &WorkspaceEnv,
    ) -> Option<ProcessModel> {
        let settings = &run.context.settings.export;
        let name = output
            .value
            .split('@')
            .next()
            .unwrap_or(&output.value)
            .to_string();

        let (tool, format) = match kind {
            ExportKind::Raster => (
                &settings.raster_tool,
                non_empty(format, &settings.raster_format),
            ),
            ExportKind::Vector => (
                &settings.vector_tool,
                non_empty(format, &settings.vector_format),
            ),
            ExportKind::File => {
                self.pending.push(PendingExport {
                    path: env.mapset_dir.join(&output.value),
                    base: env.mapset_dir.clone(),
                    name: output.value.clone(),
                    kind,
                    format: format.to_string(),
                });
                return None;
            }
        };

        let path = env
            .export_dir
            .join(format!("{name}.{}", file_extension(&format)));
        self.pending.push(PendingExport {
            name: name.clone(),
            kind,
            format: format.clone(),
            path: path.clone(),
            base: env.export_dir.clone(),
        });

        Some(ProcessModel {
            id: id.to_string(),
            label: Some(format!("export_{name}")),
            executable: Executable::Module(tool.clone()),
            inputs: vec![
                ProcessParam::new("input", &output.value),
                ProcessParam::new("format", format),
            ],
            outputs: vec![ProcessParam::new("output", path.display().to_string())],
            flags: String::new(),
            params: Vec::new(),
            stdin: None,
            native_region: false,
            internal: true,
        })
    }
}

fn non_empty(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

#[async_trait]
impl<J: ProcessingJob> ProcessingJob for ExportJob<J> {
    fn handler(&self) -> HandlerKind {
        HandlerKind::select(self.inner.handler().is_persistent(), true)
    }

    async fn create_environment(&mut self, run: &JobRun) -> Result<WorkspaceEnv, ProcessingError> {
        self.inner.create_environment(run).await
    }

    fn extend_chain(
        &mut self,
        chain: ProcessChain,
        env: &WorkspaceEnv,
        run: &JobRun,
    ) -> Result<ProcessChain, ProcessingError> {
        let mut chain = self.inner.extend_chain(chain, env, run)?;
        let declared: Vec<(ProcessParam, ExportKind, String)> = chain
            .steps
            .iter()
            .filter(|step| !step.internal)
            .flat_map(|step| step.exported_outputs())
            .map(|(param, spec)| (param.clone(), spec.kind, spec.format.clone()))
            .collect();

        for (output, kind, format) in declared {
            let id = chain.len() + 1;
            if let Some(step) = self.export_step(id, &output, (kind, &format), run, env) {
                chain.steps.push(step);
            }
        }
        Ok(chain)
    }

    async fn after_step(&mut self, run: &JobRun) -> Result<(), ProcessingError> {
        self.inner.after_step(run).await
    }

    async fn finish(
        &mut self,
        results: &mut ProcessResults,
        run: &JobRun,
    ) -> Result<(), ProcessingError> {
        self.inner.finish(results, run).await?;

        let storage = &run.services.storage;
        let user_id = run.context.user_id();

        for export in &mut self.pending {
            export.path = contained(&export.path, &export.base).await?;
        }

        if let Some(limit) = run.context.quota.storage_limit {
            let mut used = storage.size(user_id).await?;
            for export in &self.pending {
                used += tokio::fs::metadata(&export.path)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
            }
            if used > limit {
                return Err(StorageError::QuotaExceeded { used, limit }.into());
            }
        }

        for export in self.pending.drain(..) {
            let url = storage
                .store(user_id, &run.resource_id, &export.path)
                .await?;
            tracing::info!(resource_id = %run.resource_id, name = %export.name, url = %url, "Exported resource");
            results.exports.push(ExportedResource {
                name: export.name,
                kind: export.kind,
                format: export.format,
                url,
            });
        }
        Ok(())
    }

    async fn final_cleanup(&mut self, run: &JobRun) {
        self.inner.final_cleanup(run).await;
    }
}

/// The strategy a worker runs for a handler.
pub fn build_job(handler: HandlerKind) -> Box<dyn ProcessingJob> {
    match handler {
        HandlerKind::EphemeralProcessing => Box::new(EphemeralJob::default()),
        HandlerKind::EphemeralExport => Box::new(ExportJob::new(EphemeralJob::default())),
        HandlerKind::PersistentProcessing => Box::new(PersistentJob::default()),
        HandlerKind::PersistentExport => Box::new(ExportJob::new(PersistentJob::default())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_job_matches_handler() {
        for handler in [
            HandlerKind::EphemeralProcessing,
            HandlerKind::EphemeralExport,
            HandlerKind::PersistentProcessing,
            HandlerKind::PersistentExport,
        ] {
            assert_eq!(build_job(handler).handler(), handler);
        }
    }

    #[tokio::test]
    async fn test_contained_rejects_paths_leaving_the_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("mapset");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(base.join("report.csv"), "a,b").unwrap();
        std::fs::write(dir.path().join("secret"), "raster").unwrap();

        assert!(contained(&base.join("report.csv"), &base).await.is_ok());
        assert!(matches!(
            contained(&base.join("../secret"), &base).await,
            Err(StorageError::OutsideWorkspace(_))
        ));
        assert!(matches!(
            contained(&base.join(dir.path().join("secret")), &base).await,
            Err(StorageError::OutsideWorkspace(_))
        ));
        assert!(matches!(
            contained(&base.join("missing.csv"), &base).await,
            Err(StorageError::MissingFile(_))
        ));
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("GTiff"), "tif");
        assert_eq!(file_extension("GPKG"), "gpkg");
        assert_eq!(file_extension("ESRI Shapefile"), "shp");
        assert_eq!(file_extension("netCDF"), "netcdf");
    }
}
