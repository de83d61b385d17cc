//! Execution context models.
//!
//! The [`ExecutionContext`] is built once per request by the request layer
//! and handed to exactly one worker. It carries identifiers only (no open
//! handles) so it can be serialized onto the distributed queue.

use crate::chain_models::ChainDescription;
use crate::config_models::ExportSettings;
use crate::resource_models::ApiInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ts_rs::TS;

/// Role of the requesting identity, ordered from least to most privileged.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, TS)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Guest,
    User,
    Admin,
    Superadmin,
}

/// Who is asking.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct UserIdentity {
    pub user_id: String,
    pub role: UserRole,
    pub group: String,
}

/// Per-identity limits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(default)]
pub struct UserQuota {
    /// Maximum number of raster cells (rows * cols) a raster target may cover.
    pub cell_limit: u64,

    /// Maximum number of steps in one chain.
    pub process_num_limit: usize,

    /// Wall-clock limit for a single step, in seconds.
    pub process_time_limit: u64,

    /// Maximum bytes of exported results kept in storage for this identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_limit: Option<u64>,
}

impl Default for UserQuota {
    fn default() -> Self {
        Self {
            cell_limit: 100_000_000,
            process_num_limit: 20,
            process_time_limit: 600,
            storage_limit: None,
        }
    }
}

/// What the identity may touch.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, TS)]
pub struct UserPermissions {
    /// Location name -> mapsets readable by this identity.
    #[serde(default)]
    pub accessible_datasets: BTreeMap<String, Vec<String>>,

    /// Tools and executables this identity may invoke.
    #[serde(default)]
    pub accessible_modules: Vec<String>,
}

impl UserPermissions {
    pub fn can_access_location(&self, location: &str) -> bool {
        self.accessible_datasets.contains_key(location)
    }

    pub fn can_access_mapset(&self, location: &str, mapset: &str) -> bool {
        self.accessible_datasets
            .get(location)
            .is_some_and(|mapsets| mapsets.iter().any(|m| m == mapset))
    }

    pub fn can_run(&self, tool: &str) -> bool {
        self.accessible_modules.iter().any(|m| m == tool)
    }
}

/// A user definition as stored in `.geoproc/users/*.yaml`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct UserProfile {
    #[serde(flatten)]
    pub identity: UserIdentity,

    #[serde(default)]
    pub quota: UserQuota,

    #[serde(default)]
    pub permissions: UserPermissions,
}

/// Target workspace coordinates. `mapset` is `None` for ephemeral runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct WorkspaceTarget {
    pub location: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapset: Option<String>,
}

impl WorkspaceTarget {
    pub fn ephemeral(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            mapset: None,
        }
    }

    pub fn persistent(location: impl Into<String>, mapset: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            mapset: Some(mapset.into()),
        }
    }

    /// Lock key of a persistent workspace: `location/mapset`.
    pub fn workspace_id(&self) -> Option<String> {
        self.mapset
            .as_ref()
            .map(|mapset| format!("{}/{}", self.location, mapset))
    }
}

/// Raw request payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RequestPayload {
    /// A client process chain.
    ProcessChain(ChainDescription),

    /// Opaque data for a built-in chain template.
    Custom {
        template: String,
        #[ts(type = "unknown")]
        data: serde_json::Value,
    },
}

/// Storage backends a worker knows how to resolve.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Filesystem,
}

/// Identifier of the output storage; resolved to a live backend by the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct StorageHandle {
    pub backend: StorageBackend,
    /// Namespace within the backend, normally the user id.
    pub namespace: String,
}

/// Configuration snapshot taken when the job was constructed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct EngineSettings {
    /// TTL of workspace locks, in seconds.
    pub lock_ttl_secs: u64,

    /// Prefix of status poll URLs.
    pub status_base_url: String,

    pub export: ExportSettings,
}

/// Everything a worker needs to run one job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ExecutionContext {
    pub resource_id: String,
    pub identity: UserIdentity,
    pub quota: UserQuota,
    pub permissions: UserPermissions,
    pub workspace: WorkspaceTarget,
    pub payload: RequestPayload,
    pub storage: StorageHandle,
    pub api_info: ApiInfo,
    pub settings: EngineSettings,
    pub accepted_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn is_persistent(&self) -> bool {
        self.workspace.mapset.is_some()
    }
}
