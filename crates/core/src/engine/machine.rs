//! Processing State Machine.
//!
//! `Created -> Prepared -> Running(i) -> {Completed | Failed | TimedOut}`.
//! Steps run strictly in order; each one is bounded by the identity's
//! process time limit and by what is left of the overall job timeout. The
//! resource record is updated after every step, and the job's cleanup runs
//! on every exit path before the record is finalized.

use super::error::ProcessingError;
use super::job::{JobRun, ProcessingJob};
use super::results::parse_key_values;
use crate::registry::{Outcome, StepUpdate};
use crate::runner::{ToolInvocation, ToolOutput};
use gp_protocol::{OutputStream, ProcessResults, Progress, StepLogEntry};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Created,
    Prepared,
    /// 1-based index of the step being executed.
    Running(usize),
    Completed,
    Failed,
    TimedOut,
}

impl MachineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MachineState::Completed | MachineState::Failed | MachineState::TimedOut
        )
    }
}

pub struct ProcessingMachine {
    job: Box<dyn ProcessingJob>,
    run: JobRun,
    state: MachineState,
}

/// Last lines of a failing step's stderr, for the record message.
fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(3);
    lines[start..].join("\n")
}

impl ProcessingMachine {
    pub fn new(job: Box<dyn ProcessingJob>, run: JobRun) -> Self {
        Self {
            job,
            run,
            state: MachineState::Created,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    fn transition(&mut self, next: MachineState) {
        tracing::trace!(from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }

    /// Run the job to a terminal state and finalize its resource record.
    pub async fn execute(mut self) -> MachineState {
        let result = self.drive().await;
        self.job.final_cleanup(&self.run).await;

        let outcome = match result {
            Ok(results) => {
                self.transition(MachineState::Completed);
                tracing::info!(steps = self.run.chain.len(), "Processing finished");
                Outcome::finished("Processing successfully finished", results)
            }
            Err(error) => {
                if self.state != MachineState::TimedOut {
                    self.transition(MachineState::Failed);
                }
                if error.is_internal() {
                    tracing::error!(error = ?error, "Processing failed with an internal error");
                } else {
                    tracing::warn!(error = %error, code = ?error.code(), "Processing failed");
                }
                Outcome::failed(error.to_exception())
            }
        };

        if let Err(e) = self
            .run
            .services
            .registry
            .finalize(&self.run.resource_id, outcome)
            .await
        {
            tracing::error!(error = %e, "Failed to finalize resource record");
        }
        self.state
    }

    async fn drive(&mut self) -> Result<ProcessResults, ProcessingError> {
        let env = self.job.create_environment(&self.run).await?;
        self.transition(MachineState::Prepared);

        let chain = self
            .job
            .extend_chain(self.run.chain.clone(), &env, &self.run)?;
        let total = chain.len();
        let process_limit = Duration::from_secs(self.run.context.quota.process_time_limit);

        let mut captured: BTreeMap<String, ToolOutput> = BTreeMap::new();
        let mut results = ProcessResults::default();

        for (index, step) in chain.steps.iter().enumerate() {
            self.transition(MachineState::Running(index + 1));

            let remaining = self.run.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.transition(MachineState::TimedOut);
                return Err(ProcessingError::JobTimeout {
                    step_id: step.id.clone(),
                    limit_secs: self.run.job_timeout.as_secs(),
                });
            }
            let budget = process_limit.min(remaining);

            let stdin = step.stdin.as_ref().map(|source| {
                captured
                    .get(&source.step_id)
                    .map(|output| match source.stream {
                        OutputStream::Stdout => output.stdout.clone(),
                        OutputStream::Stderr => output.stderr.clone(),
                    })
                    .unwrap_or_default()
            });

            let invocation = ToolInvocation::for_step(step, &env, stdin);
            tracing::debug!(step = %step.id, executable = %step.executable, args = ?invocation.args, "Running step");

            let output = self
                .run
                .services
                .runner
                .run(&invocation, budget)
                .await
                .map_err(|e| ProcessingError::StepExecution {
                    step_id: step.id.clone(),
                    executable: step.executable.to_string(),
                    return_code: None,
                    message: e.to_string(),
                })?;

            let entry = StepLogEntry {
                id: step.id.clone(),
                executable: step.executable.to_string(),
                parameters: invocation.args.clone(),
                return_code: output.exit_code,
                stdout: output.stdout.clone(),
                stderr: output.stderr.clone(),
                run_time: output.run_time.as_secs_f64(),
                timed_out: output.timed_out,
            };
            self.run
                .services
                .registry
                .update(
                    &self.run.resource_id,
                    StepUpdate {
                        progress: Progress {
                            step: index + 1,
                            num_of_steps: total,
                        },
                        log_entry: Some(entry),
                        message: Some(format!(
                            "Step {} of {total} ({}) finished",
                            index + 1,
                            step.executable
                        )),
                    },
                )
                .await?;

            if output.timed_out {
                self.transition(MachineState::TimedOut);
                return Err(if budget < process_limit {
                    ProcessingError::JobTimeout {
                        step_id: step.id.clone(),
                        limit_secs: self.run.job_timeout.as_secs(),
                    }
                } else {
                    ProcessingError::Timeout {
                        step_id: step.id.clone(),
                        limit_secs: process_limit.as_secs(),
                    }
                });
            }

            if !output.succeeded() {
                return Err(ProcessingError::StepExecution {
                    step_id: step.id.clone(),
                    executable: step.executable.to_string(),
                    return_code: output.exit_code,
                    message: stderr_tail(&output.stderr),
                });
            }

            if !step.internal {
                if let Some(values) = parse_key_values(&output.stdout) {
                    results.step_outputs.insert(step.id.clone(), values);
                }
            }
            captured.insert(step.id.clone(), output);

            self.job.after_step(&self.run).await?;
        }

        self.job.finish(&mut results, &self.run).await?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        assert_eq!(stderr_tail("a\n\nb\nc\nd\n"), "b\nc\nd");
        assert_eq!(stderr_tail(""), "");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!MachineState::Running(1).is_terminal());
        assert!(MachineState::TimedOut.is_terminal());
    }
}
