//! # gp-core
//!
//! Asynchronous geoprocessing job engine. A request is validated into a
//! process chain, recorded as a resource and queued; a worker then runs the
//! chain's external tools one by one in an ephemeral or persistent workspace
//! and reports every step into the resource registry, which clients poll.
//!
//! ## Modules
//!
//! - [`config`]: loading `.geoproc/` (engine settings, users, named chains)
//! - [`chain`]: chain description compiler, validator and templates
//! - [`workspace`]: database layout, regions, ephemeral/persistent workspaces
//! - [`runner`]: external tool invocation
//! - [`store`]: versioned key-value store shared by registry, locks and queue
//! - [`lock`]: workspace locks with TTL
//! - [`registry`]: resource records
//! - [`storage`]: storage for exported files
//! - [`engine`]: processing state machine and job strategies
//! - [`queue`]: local and distributed job queues
//! - [`service`]: request-facing facade
//! - [`runtime`]: assembling all of the above from configuration

pub mod chain;
pub mod config;
pub mod engine;
pub mod lock;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod service;
pub mod storage;
pub mod store;
pub mod workspace;
