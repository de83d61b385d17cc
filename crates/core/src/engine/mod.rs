//! Job execution engine.
//!
//! [`ProcessingMachine`] drives a validated chain through its states using a
//! [`ProcessingJob`] strategy chosen from the job's handler:
//!
//! - [`EphemeralJob`]: disposable workspace, nothing persistent is touched
//! - [`PersistentJob`]: named mapset under an exclusive workspace lock
//! - [`ExportJob`]: either of the above plus export steps and storage upload

pub mod error;
pub mod job;
pub mod machine;
pub mod results;

pub use error::{ProcessingError, INTERNAL_ERROR_MESSAGE};
pub use job::{
    build_job, EphemeralJob, ExportJob, JobRun, PersistentJob, ProcessingJob, WorkerServices,
};
pub use machine::{MachineState, ProcessingMachine};
pub use results::parse_key_values;
