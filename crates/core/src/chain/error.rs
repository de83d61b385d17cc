//! Validation errors. All of them are raised before a job is enqueued.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Process chain is empty")]
    EmptyChain,

    #[error("Invalid step key '{0}': keys must be positive integers")]
    InvalidStepKey(String),

    #[error("Invalid step {step}: {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("Invalid stdin of step {step}: {reason}")]
    InvalidStdin { step: String, reason: String },

    #[error("Step {step}: '{tool}' is not in the list of permitted modules")]
    ModuleNotPermitted { step: String, tool: String },

    #[error("Location '{0}' is not accessible")]
    LocationNotAccessible(String),

    #[error("Step {step}: export '{value}' must name a file of the current mapset")]
    InvalidExport { step: String, value: String },

    #[error("Mapset '{mapset}' of location '{location}' is not accessible")]
    MapsetNotAccessible { location: String, mapset: String },

    #[error("Step {step}: dataset '{dataset}' is not accessible")]
    DatasetNotAccessible { step: String, dataset: String },

    #[error("Step {step}: dataset '{dataset}' does not exist")]
    UnknownDataset { step: String, dataset: String },

    #[error("Step {step}: '{dataset}' is only produced by later step {producer}")]
    ForwardReference {
        step: String,
        dataset: String,
        producer: String,
    },

    #[error("Process chain has {count} steps, the limit is {limit}")]
    ProcessLimitExceeded { count: usize, limit: usize },

    #[error("Step {step}: region of {cells} cells exceeds the cell limit of {limit}")]
    CellLimitExceeded { step: String, cells: u64, limit: u64 },

    #[error("Region unavailable: {0}")]
    RegionUnavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("Invalid data for template '{template}': {reason}")]
    InvalidTemplateData { template: String, reason: String },
}
