//! Scripted runner standing in for the external toolchain in tests and
//! dry runs.

use super::{RunnerError, ToolInvocation, ToolOutput, ToolRunner};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Canned response for one tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedStep {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub delay: Duration,
    /// Write `stdout` to the path given by the `output=` argument.
    pub writes_output: bool,
}

impl ScriptedStep {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            delay: Duration::ZERO,
            writes_output: false,
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            delay: Duration::ZERO,
            writes_output: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn writing_output(mut self) -> Self {
        self.writes_output = true;
        self
    }
}

/// Answers each tool with the next scripted step registered for it, falling
/// back to a per-tool default and then to an empty success.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    queued: Mutex<HashMap<String, VecDeque<ScriptedStep>>>,
    defaults: HashMap<String, ScriptedStep>,
    invocations: Mutex<Vec<ToolInvocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response for every run of `tool` without a queued step.
    pub fn on(mut self, tool: &str, step: ScriptedStep) -> Self {
        self.defaults.insert(tool.to_string(), step);
        self
    }

    /// Response for the next run of `tool` only.
    pub fn once(mut self, tool: &str, step: ScriptedStep) -> Self {
        self.queued
            .get_mut()
            .entry(tool.to_string())
            .or_default()
            .push_back(step);
        self
    }

    /// Every invocation seen so far, in order.
    pub async fn invocations(&self) -> Vec<ToolInvocation> {
        self.invocations.lock().await.clone()
    }

    async fn next_step(&self, tool: &str) -> ScriptedStep {
        let queued = self
            .queued
            .lock()
            .await
            .get_mut(tool)
            .and_then(VecDeque::pop_front);
        queued
            .or_else(|| self.defaults.get(tool).cloned())
            .unwrap_or_else(|| ScriptedStep::success(""))
    }
}

#[async_trait]
impl ToolRunner for ScriptedRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        timeout: Duration,
    ) -> Result<ToolOutput, RunnerError> {
        self.invocations.lock().await.push(invocation.clone());
        let step = self.next_step(invocation.executable.name()).await;
        let started = Instant::now();

        if step.delay > timeout {
            tokio::time::sleep(timeout).await;
            return Ok(ToolOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                run_time: started.elapsed(),
                timed_out: true,
            });
        }
        tokio::time::sleep(step.delay).await;

        if step.writes_output {
            let target = invocation
                .args
                .iter()
                .find_map(|arg| arg.strip_prefix("output="));
            if let Some(target) = target {
                tokio::fs::write(invocation.working_dir.join(target), &step.stdout)
                    .await
                    .map_err(|source| RunnerError::Io {
                        program: invocation.executable.name().to_string(),
                        source,
                    })?;
            }
        }

        Ok(ToolOutput {
            exit_code: Some(step.exit_code),
            stdout: step.stdout,
            stderr: step.stderr,
            run_time: started.elapsed(),
            timed_out: false,
        })
    }
}
