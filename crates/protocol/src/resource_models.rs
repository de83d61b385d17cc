//! Resource record models.
//!
//! The [`ResourceRecord`] is the only externally visible entity of the
//! engine: clients poll it by resource id until it reaches a terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ts_rs::TS;

/// Lifecycle status of a resource.
///
/// `Accepted -> Running -> {Finished | Error | Terminated}`. Terminal states
/// are reached exactly once and never left.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Accepted,
    Running,
    Finished,
    Error,
    Terminated,
}

impl ResourceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResourceStatus::Finished | ResourceStatus::Error | ResourceStatus::Terminated
        )
    }
}

/// Wire level error classification.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationFailed,
    LockBusy,
    StepFailed,
    Timeout,
    StorageFailed,
    InternalError,
    Terminated,
}

/// `step / num_of_steps`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, TS)]
pub struct Progress {
    pub step: usize,
    pub num_of_steps: usize,
}

/// Captured outcome of one executed step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct StepLogEntry {
    pub id: String,
    pub executable: String,
    pub parameters: Vec<String>,

    /// `None` when the process was killed before reporting an exit code.
    pub return_code: Option<i32>,

    pub stdout: String,
    pub stderr: String,

    /// Wall-clock run time in seconds.
    pub run_time: f64,

    #[serde(default)]
    pub timed_out: bool,
}

/// Metadata of the API call that created the resource.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, TS)]
pub struct ApiInfo {
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub request_url: String,
}

/// Poll URL and URLs of exported resources.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, TS)]
pub struct ResourceUrls {
    pub status: String,

    #[serde(default)]
    pub resources: Vec<String>,
}

/// A file handed to the storage interface.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct ExportedResource {
    pub name: String,
    pub kind: crate::process_models::ExportKind,
    pub format: String,
    pub url: String,
}

/// Typed result payload of a finished job.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, TS)]
pub struct ProcessResults {
    /// Parsed `key=value` stdout, keyed by step id.
    #[serde(default)]
    pub step_outputs: BTreeMap<String, BTreeMap<String, String>>,

    #[serde(default)]
    pub exports: Vec<ExportedResource>,
}

/// Failure details attached to a record in `error`/`terminated` state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct ExceptionInfo {
    pub code: ErrorCode,
    pub message: String,

    /// Id of the step that failed, when a step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,

    /// Whether resubmitting the same request may succeed.
    pub retryable: bool,
}

/// The externally visible state of one job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ResourceRecord {
    pub resource_id: String,
    pub user_id: String,
    pub status: ResourceStatus,

    /// Human readable summary of the current state.
    pub message: String,

    pub progress: Progress,

    /// Append-only, one entry per executed step in submission order.
    pub process_log: Vec<StepLogEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_results: Option<ProcessResults>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,

    pub urls: ResourceUrls,
    pub api_info: ApiInfo,

    pub accepted_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// A fresh record in `accepted` state.
    pub fn accepted(
        resource_id: impl Into<String>,
        user_id: impl Into<String>,
        urls: ResourceUrls,
        api_info: ApiInfo,
        accepted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            user_id: user_id.into(),
            status: ResourceStatus::Accepted,
            message: "Resource accepted".to_string(),
            progress: Progress::default(),
            process_log: Vec::new(),
            process_results: None,
            exception: None,
            urls,
            api_info,
            accepted_at,
            started_at: None,
            finished_at: None,
            updated_at: accepted_at,
        }
    }
}

/// Immediate answer of an asynchronous submission.
///
/// HTTP 200 is used even though the job is only accepted; the `status`
/// field carries the acceptance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct SubmitResponse {
    pub resource_id: String,
    pub status: ResourceStatus,
    pub urls: ResourceUrls,
}
