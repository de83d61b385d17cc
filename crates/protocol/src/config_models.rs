//! Engine configuration models for `.geoproc/config.toml`.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//!
//! # Example
//!
//! ```toml
//! [queue]
//! kind = "distributed"
//! workers = 4
//!
//! [queue.store]
//! kind = "filesystem"
//! path = "/var/lib/geoproc/store"
//!
//! [workspace]
//! database = "/var/lib/geoproc/grassdb"
//!
//! [locks]
//! ttl_secs = 900
//! ```

use crate::context_models::UserQuota;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use ts_rs::TS;

/// Which job queue implementation to use.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Bounded worker pool inside the submitting process.
    #[default]
    Local,
    /// Jobs are written to the shared store and consumed by `geoproc worker`.
    Distributed,
}

/// Backing store for registry, locks and the distributed queue.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    Filesystem { path: PathBuf },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub kind: QueueKind,
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub store: StoreConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: QueueKind::Local,
            workers: 2,
            poll_interval_ms: 250,
            store: StoreConfig::Memory,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root of the geodata database (`<database>/<location>/<mapset>`).
    pub database: PathBuf,

    /// Where ephemeral workspaces are created; system temp dir if unset.
    pub temp_dir: Option<PathBuf>,

    /// Directory searched for tool executables before `PATH`.
    pub tool_path: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("grassdb"),
            temp_dir: None,
            tool_path: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl_secs: 900 }
    }
}

/// How long terminal resource records are kept.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_age_secs: u64,
    pub max_records: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 7 * 24 * 3600,
            max_records: 10_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("resources"),
            base_url: "file://resources".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    pub status_base_url: String,

    /// Overall job timeout, also the bound of the synchronous poll loop.
    pub job_timeout_secs: u64,

    pub poll_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            status_base_url: "http://localhost:8088/api/v1/resources".to_string(),
            job_timeout_secs: 3600,
            poll_interval_ms: 200,
        }
    }
}

/// Tools used for the export steps appended to exporting jobs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(default)]
pub struct ExportSettings {
    pub raster_tool: String,
    pub vector_tool: String,
    pub raster_format: String,
    pub vector_format: String,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            raster_tool: "r.out.gdal".to_string(),
            vector_tool: "v.out.ogr".to_string(),
            raster_format: "GTiff".to_string(),
            vector_format: "GPKG".to_string(),
        }
    }
}

/// Top level of `.geoproc/config.toml`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub workspace: WorkspaceConfig,
    pub locks: LockConfig,
    pub retention: RetentionConfig,
    pub storage: StorageConfig,
    pub service: ServiceConfig,
    pub export: ExportSettings,
    pub default_quota: UserQuota,
}
