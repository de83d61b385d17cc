//! Runs steps as child processes.

use super::{RunnerError, ToolInvocation, ToolOutput, ToolRunner};
use async_trait::async_trait;
use gp_protocol::Executable;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;

/// How long to keep draining output pipes after a killed process. Grand
/// children may hold the pipes open long after the tool itself is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Spawns tools with `tokio::process`.
///
/// Named tools are looked up in `tool_path` first, then on `PATH`; raw
/// executables are looked up on `PATH` (or used as given when they contain
/// a path separator).
#[derive(Debug, Clone, Default)]
pub struct SubprocessRunner {
    tool_path: Option<PathBuf>,
}

impl SubprocessRunner {
    pub fn new(tool_path: Option<PathBuf>) -> Self {
        Self { tool_path }
    }

    fn resolve(&self, executable: &Executable) -> Result<PathBuf, RunnerError> {
        if let (Executable::Module(name), Some(dir)) = (executable, &self.tool_path) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        which::which(executable.name())
            .map_err(|_| RunnerError::NotFound(executable.name().to_string()))
    }
}

/// Collect output line by line. Lines that are not UTF-8 are decoded
/// lossily so the pipe is always drained to the end.
async fn collect_lines<R>(reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = SplitStream::new(BufReader::new(reader).split(b'\n'));
    let mut collected = String::new();
    while let Some(Ok(line)) = lines.next().await {
        collected.push_str(&String::from_utf8_lossy(&line));
        collected.push('\n');
    }
    collected
}

fn spawn_collector<R>(reader: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match reader {
            Some(reader) => collect_lines(reader).await,
            None => String::new(),
        }
    })
}

async fn finish_collector(mut handle: JoinHandle<String>, bounded: bool) -> String {
    if !bounded {
        return handle.await.unwrap_or_default();
    }
    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(result) => result.unwrap_or_default(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

#[async_trait]
impl ToolRunner for SubprocessRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        timeout: Duration,
    ) -> Result<ToolOutput, RunnerError> {
        let program = self.resolve(&invocation.executable)?;
        let name = invocation.executable.name().to_string();

        let mut cmd = Command::new(&program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            step_id = %invocation.step_id,
            program = %program.display(),
            args = ?invocation.args,
            "Spawning tool"
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: name.clone(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (invocation.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                // The tool may exit without reading all of it.
                let _ = pipe.write_all(input.as_bytes()).await;
            });
        }

        let stdout = spawn_collector(child.stdout.take());
        let stderr = spawn_collector(child.stderr.take());

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status.map_err(|source| RunnerError::Io {
                    program: name.clone(),
                    source,
                })?;
                (status.code(), false)
            }
            Err(_) => {
                tracing::warn!(
                    step_id = %invocation.step_id,
                    tool = %name,
                    limit_secs = timeout.as_secs_f64(),
                    "Tool exceeded its time limit, killing"
                );
                let _ = child.kill().await;
                (None, true)
            }
        };

        Ok(ToolOutput {
            exit_code,
            stdout: finish_collector(stdout, timed_out).await,
            stderr: finish_collector(stderr, timed_out).await,
            run_time: started.elapsed(),
            timed_out,
        })
    }
}
