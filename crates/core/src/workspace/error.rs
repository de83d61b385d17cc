use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Workspace I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid workspace name '{0}'")]
    InvalidName(String),

    #[error("Location '{0}' does not exist")]
    UnknownLocation(String),

    #[error("No region defined for {location}/{mapset}")]
    MissingRegion { location: String, mapset: String },

    #[error("Invalid region file {path}: {reason}")]
    InvalidRegion { path: PathBuf, reason: String },

    #[error("Failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        source: walkdir::Error,
    },
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;
