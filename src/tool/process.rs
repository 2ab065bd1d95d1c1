//! Subprocess executor.
//!
//! Runs each [`Command`] as a direct child process (no shell), waits for it
//! asynchronously and enforces the command timeout.
//!
//! # Characteristics
//!
//! | Feature | Behaviour |
//! |---------|-----------|
//! | Output | streamed line by line to the log, last [`TAIL_LINES`] kept per stream |
//! | Timeout | child killed, status [`STATUS_TIMED_OUT`] |
//! | Cancellation | child killed, `Ok(None)` returned |
//! | Spawn failure | [`ToolError::SpawnFailed`] |

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Command, ExecResult, Executor, STATUS_INVOCATION_ERROR, STATUS_TIMED_OUT, ToolError, ToolResult,
};

/// Lines of each output stream kept in [`ExecResult`].
pub const TAIL_LINES: usize = 200;

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// The most recent lines of one output stream.
#[derive(Debug)]
struct Tail {
    lines: VecDeque<String>,
}

impl Tail {
    fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(TAIL_LINES),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn into_string(self) -> String {
        Vec::from(self.lines).join("\n")
    }
}

/// Executor that runs commands as local child processes.
///
/// The child is spawned with `kill_on_drop`, so abandoning the wait on
/// timeout or cancellation also terminates the process.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    /// Creates a new process executor.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(
        &self,
        cmd: &Command,
        cancel: &CancellationToken,
    ) -> ToolResult<Option<ExecResult>> {
        let start = Instant::now();

        let mut process = tokio::process::Command::new(&cmd.program);
        process.args(&cmd.args);
        if let Some(dir) = &cmd.working_dir {
            process.current_dir(dir);
        }
        for (key, value) in &cmd.env {
            process.env(key, value);
        }
        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Spawning: {}", cmd.to_shell_string());
        let mut child = process.spawn().map_err(|source| ToolError::SpawnFailed {
            program: cmd.program.clone(),
            source,
        })?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ToolError::Io(std::io::Error::other("child output not captured")));
        };
        let label = cmd.label.clone().unwrap_or_else(|| cmd.program.clone());

        // A zero timeout would fire immediately; treat it as "no deadline".
        let deadline = cmd
            .timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let timeout = async {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Owns the child, so dropping it on timeout or cancel kills the process.
        let run = async move {
            let stdout_lines = LinesStream::new(BufReader::new(stdout).lines())
                .map(|line| OutputLine::Stdout(line.unwrap_or_default()));
            let stderr_lines = LinesStream::new(BufReader::new(stderr).lines())
                .map(|line| OutputLine::Stderr(line.unwrap_or_default()));
            let mut lines = stream::select(stdout_lines, stderr_lines);

            let mut stdout_tail = Tail::new();
            let mut stderr_tail = Tail::new();
            while let Some(line) = lines.next().await {
                match line {
                    OutputLine::Stdout(line) => {
                        info!("[{}] {}", label, line);
                        stdout_tail.push(line);
                    }
                    OutputLine::Stderr(line) => {
                        info!("[{}] {}", label, line);
                        stderr_tail.push(line);
                    }
                }
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout_tail, stderr_tail))
        };

        select! {
            finished = run => {
                let (status, stdout_tail, stderr_tail) = finished?;
                // No code means the child died from a signal.
                let exit_code = status.code().unwrap_or(STATUS_INVOCATION_ERROR);
                if exit_code != 0 {
                    debug!("{} exited with {}", cmd.program, exit_code);
                }

                Ok(Some(ExecResult {
                    exit_code,
                    stdout: stdout_tail.into_string(),
                    stderr: stderr_tail.into_string(),
                    duration: start.elapsed(),
                }))
            }
            _ = timeout => {
                warn!(
                    "Killed after {}s: {}",
                    deadline.map(|d| d.as_secs()).unwrap_or_default(),
                    cmd.to_shell_string()
                );
                Ok(Some(ExecResult {
                    exit_code: STATUS_TIMED_OUT,
                    stdout: String::new(),
                    stderr: "timed out".to_string(),
                    duration: start.elapsed(),
                }))
            }
            _ = cancel.cancelled() => {
                debug!("Cancelled: {}", cmd.to_shell_string());
                Ok(None)
            }
        }
    }
}
