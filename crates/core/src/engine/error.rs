//! Errors raised while a worker processes a job.
//!
//! None of these escape the state machine: each is converted into a
//! terminal resource record through [`ProcessingError::to_exception`].

use crate::chain::ValidationError;
use crate::lock::LockError;
use crate::registry::RegistryError;
use crate::storage::StorageError;
use crate::workspace::WorkspaceError;
use gp_protocol::{ErrorCode, ExceptionInfo};
use thiserror::Error;

/// Message stored in records for faults in the engine itself. The full
/// error is only logged.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal error while processing the job";

fn code_text(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Workspace {workspace} is locked by resource {holder}, try again later")]
    LockBusy { workspace: String, holder: String },

    #[error("Lock on workspace {workspace} was reclaimed by another job")]
    LockLost { workspace: String },

    #[error("Step {step_id} ({executable}) failed with return code {}: {message}", code_text(.return_code))]
    StepExecution {
        step_id: String,
        executable: String,
        return_code: Option<i32>,
        message: String,
    },

    #[error("Step {step_id} exceeded the process time limit of {limit_secs} seconds")]
    Timeout { step_id: String, limit_secs: u64 },

    #[error("Job exceeded its overall time limit of {limit_secs} seconds at step {step_id}")]
    JobTimeout { step_id: String, limit_secs: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Lock(LockError),

    #[error("{0}")]
    Internal(String),
}

impl From<LockError> for ProcessingError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Busy {
                workspace_id,
                holder,
            } => ProcessingError::LockBusy {
                workspace: workspace_id,
                holder,
            },
            LockError::Lost { workspace_id, .. } => ProcessingError::LockLost {
                workspace: workspace_id,
            },
            other => ProcessingError::Lock(other),
        }
    }
}

impl ProcessingError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProcessingError::Validation(_) => ErrorCode::ValidationFailed,
            ProcessingError::LockBusy { .. } | ProcessingError::LockLost { .. } => {
                ErrorCode::LockBusy
            }
            ProcessingError::StepExecution { .. } => ErrorCode::StepFailed,
            ProcessingError::Timeout { .. } | ProcessingError::JobTimeout { .. } => {
                ErrorCode::Timeout
            }
            ProcessingError::Storage(_) => ErrorCode::StorageFailed,
            ProcessingError::Workspace(_)
            | ProcessingError::Registry(_)
            | ProcessingError::Lock(_)
            | ProcessingError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether resubmitting the same request may succeed.
    pub fn retryable(&self) -> bool {
        self.code() == ErrorCode::LockBusy
    }

    pub fn failed_step(&self) -> Option<&str> {
        match self {
            ProcessingError::StepExecution { step_id, .. }
            | ProcessingError::Timeout { step_id, .. }
            | ProcessingError::JobTimeout { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.code() == ErrorCode::InternalError
    }

    pub fn to_exception(&self) -> ExceptionInfo {
        let message = if self.is_internal() {
            INTERNAL_ERROR_MESSAGE.to_string()
        } else {
            self.to_string()
        };
        ExceptionInfo {
            code: self.code(),
            message,
            failed_step: self.failed_step().map(str::to_string),
            retryable: self.retryable(),
        }
    }
}
