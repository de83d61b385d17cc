//! Serializable job handoff between the request layer and workers.
//!
//! A [`JobDescriptor`] is what the job queue moves around. It names the
//! handler to run and carries the execution context and the validated
//! chain, never live handles:
//!
//! ```json
//! {
//!   "resource_id": "resource_id-6a0e...",
//!   "handler": "persistent_export",
//!   "timeout_secs": 3600,
//!   "context": { ... },
//!   "chain": { "steps": [ ... ] }
//! }
//! ```

use crate::context_models::ExecutionContext;
use crate::process_models::ProcessChain;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

/// Which processing strategy a worker should run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Disposable workspace, results stay in the record.
    EphemeralProcessing,
    /// Disposable workspace, declared outputs are exported to storage.
    EphemeralExport,
    /// Runs against a named mapset under an exclusive lock.
    PersistentProcessing,
    /// Persistent run whose declared outputs are exported to storage.
    PersistentExport,
}

impl HandlerKind {
    pub fn is_persistent(self) -> bool {
        matches!(
            self,
            HandlerKind::PersistentProcessing | HandlerKind::PersistentExport
        )
    }

    pub fn exports(self) -> bool {
        matches!(self, HandlerKind::EphemeralExport | HandlerKind::PersistentExport)
    }

    /// Pick the handler for a persistence mode and export flag.
    pub fn select(persistent: bool, export: bool) -> Self {
        match (persistent, export) {
            (false, false) => HandlerKind::EphemeralProcessing,
            (false, true) => HandlerKind::EphemeralExport,
            (true, false) => HandlerKind::PersistentProcessing,
            (true, true) => HandlerKind::PersistentExport,
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerKind::EphemeralProcessing => "ephemeral_processing",
            HandlerKind::EphemeralExport => "ephemeral_export",
            HandlerKind::PersistentProcessing => "persistent_processing",
            HandlerKind::PersistentExport => "persistent_export",
        };
        f.write_str(name)
    }
}

/// One enqueued job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct JobDescriptor {
    pub resource_id: String,
    pub handler: HandlerKind,

    /// Overall job timeout in seconds, counted from the moment a worker
    /// claims the job.
    pub timeout_secs: u64,

    pub enqueued_at: DateTime<Utc>,
    pub context: ExecutionContext,
    pub chain: ProcessChain,
}
