//! Storage/Export interface.
//!
//! Finished export files are handed to a [`ResourceStorage`], which keeps
//! them outside the workspace and returns a retrieval URL. Errors from this
//! interface fail the job with `storage_failed`.

pub mod filesystem;

pub use filesystem::FileSystemStorage;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Export file {0} does not exist")]
    MissingFile(PathBuf),

    #[error("Export file {0} is outside the job workspace")]
    OutsideWorkspace(PathBuf),

    #[error("Storage limit exceeded: {used} of {limit} bytes in use")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error("Invalid storage name '{0}'")]
    InvalidName(String),

    #[error("Storage task failed: {0}")]
    Task(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait ResourceStorage: Send + Sync {
    /// Copy `file` into storage under the resource and return its URL.
    async fn store(&self, user_id: &str, resource_id: &str, file: &Path) -> StorageResult<String>;

    /// Remove every file stored for the resource. Missing resources are fine.
    async fn remove(&self, resource_id: &str) -> StorageResult<()>;

    /// Bytes currently stored for the user.
    async fn size(&self, user_id: &str) -> StorageResult<u64>;
}
