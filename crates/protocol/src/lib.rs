//! # gp-protocol
//!
//! Data models shared by the geoproc request layer, job queue and workers.
//!
//! ## Modules
//!
//! - [`process_models`]: compiled steps and process chains
//! - [`chain_models`]: client chain descriptions (versioned and keyed)
//! - [`context_models`]: execution context, identity, quota, permissions
//! - [`resource_models`]: resource records, progress, step logs, results
//! - [`job_models`]: serializable job descriptors and handler identity
//! - [`config_models`]: engine configuration from `config.toml`
//!
//! Nothing in this crate performs I/O; every type round-trips through serde
//! so it can cross a process boundary.

pub mod chain_models;
pub mod config_models;
pub mod context_models;
pub mod job_models;
pub mod process_models;
pub mod resource_models;

pub use chain_models::*;
pub use config_models::*;
pub use context_models::*;
pub use job_models::*;
pub use process_models::*;
pub use resource_models::*;
