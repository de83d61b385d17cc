//! External tool runner.
//!
//! Given an executable, its arguments and an optional stdin payload, a
//! [`ToolRunner`] returns the exit code and the captured output. A non-zero
//! exit code is data for the state machine, not an error; only failing to
//! start the tool at all is a [`RunnerError`].

pub mod scripted;
pub mod subprocess;

pub use scripted::{ScriptedRunner, ScriptedStep};
pub use subprocess::SubprocessRunner;

use crate::workspace::WorkspaceEnv;
use async_trait::async_trait;
use gp_protocol::{Executable, ProcessModel};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Executable '{0}' not found")]
    NotFound(String),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("I/O error while running '{program}': {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
}

/// One concrete invocation of a step inside a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub step_id: String,
    pub executable: Executable,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl ToolInvocation {
    pub fn for_step(step: &ProcessModel, workspace: &WorkspaceEnv, stdin: Option<String>) -> Self {
        Self {
            step_id: step.id.clone(),
            executable: step.executable.clone(),
            args: step.arguments(),
            stdin,
            working_dir: workspace.mapset_dir.clone(),
            env: workspace.variables(),
        }
    }
}

/// Captured result of one tool run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// `None` if the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub run_time: Duration,
    pub timed_out: bool,
}

impl ToolOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run the tool, killing it once `timeout` has elapsed.
    async fn run(
        &self,
        invocation: &ToolInvocation,
        timeout: Duration,
    ) -> Result<ToolOutput, RunnerError>;
}
