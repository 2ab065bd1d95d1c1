//! External test tool invocation.
//!
//! fleetrun never runs test logic itself. Each task is handed to an external
//! tool (airtest by default) as a subprocess; the exit code is the task's
//! status and the tool leaves its log artifacts in a per-task directory.
//!
//! # Architecture
//!
//! ```text
//!   TestTool                      Executor
//!      │                              │
//!      │ run_command(task)            │
//!      ├──────────► Command ─────────►│ execute(cmd, cancel)
//!      │                              ▼
//!      │ report_command(task)    Option<ExecResult>
//!      └──────────► Command ─────────►│
//! ```
//!
//! - [`TestTool`] builds the two invocations from [`ToolConfig`].
//! - [`Executor`] runs a [`Command`]; [`process::ProcessExecutor`] is the
//!   subprocess implementation, tests substitute their own.
//!
//! # Status codes
//!
//! A command that runs and exits non-zero is not an error, its exit code is
//! recorded. Conditions without an exit code map onto negative sentinels:
//!
//! | Code | Constant | Meaning |
//! |------|----------|---------|
//! | -1 | [`STATUS_INVOCATION_ERROR`] | tool could not be spawned, or report artifacts missing |
//! | -2 | [`STATUS_TIMED_OUT`] | killed after the configured timeout |

pub mod process;

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::ToolConfig;

/// Status recorded when the tool could not be invoked or left no log.
pub const STATUS_INVOCATION_ERROR: i32 = -1;

/// Status recorded when the tool was killed after its timeout.
pub const STATUS_TIMED_OUT: i32 = -2;

/// Result type for tool operations.
pub type ToolResult<T> = Result<T, ToolError>;

/// Errors that can occur while invoking the external tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The configured tool command is empty or cannot be split.
    #[error("Invalid tool command '{0}': {1}")]
    InvalidCommand(String, String),

    /// The process could not be started.
    ///
    /// A process that starts and exits non-zero is NOT this error.
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error while waiting on the process.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command to execute.
///
/// Built with a fluent API and rendered with
/// [`to_shell_string`](Self::to_shell_string) for logs and the state file.
///
/// # Example
///
/// ```
/// use fleetrun::tool::Command;
///
/// let cmd = Command::new("airtest")
///     .arg("run")
///     .arg("suite/login_test.py")
///     .args(["--device", "Android:///emulator-5554"])
///     .env("PYTHONIOENCODING", "utf-8")
///     .timeout(600);
///
/// assert_eq!(cmd.program, "airtest");
/// assert_eq!(cmd.args.len(), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory; `None` inherits the current directory.
    pub working_dir: Option<String>,

    /// Environment variables added to the inherited environment.
    pub env: Vec<(String, String)>,

    /// Maximum execution time in seconds.
    pub timeout_secs: Option<u64>,

    /// Prefix for the command's output lines in the log.
    pub label: Option<String>,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
            label: None,
        }
    }

    /// Adds a single argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory for command execution.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the execution timeout in seconds.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Sets the prefix used when logging the command's output.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Converts the command to a shell-executable string.
    ///
    /// # Example
    ///
    /// ```
    /// use fleetrun::tool::Command;
    /// let cmd = Command::new("airtest").arg("run").arg("my tests/a_test.py");
    /// assert_eq!(cmd.to_shell_string(), "airtest run 'my tests/a_test.py'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

/// Escape a string for use in a shell command.
fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| {
            c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=')
        })
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Result of executing a command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the command, or one of the negative sentinels.
    pub exit_code: i32,

    /// Last lines of standard output.
    pub stdout: String,

    /// Last lines of standard error.
    pub stderr: String,

    /// Wall-clock time the command took to execute.
    pub duration: std::time::Duration,
}

impl ExecResult {
    /// Returns `true` if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands on behalf of the orchestrator.
///
/// Implementations must be shareable across device workers.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `cmd` to completion.
    ///
    /// Returns `Ok(None)` if `cancel` fired before the command finished;
    /// the command must not outlive the call in that case.
    async fn execute(
        &self,
        cmd: &Command,
        cancel: &CancellationToken,
    ) -> ToolResult<Option<ExecResult>>;
}

/// Builds `run` and `report` invocations of the external tool.
///
/// # Example
///
/// ```
/// use fleetrun::config::ToolConfig;
/// use fleetrun::tool::TestTool;
/// use std::path::Path;
///
/// let tool = TestTool::new(ToolConfig::default())?;
/// let cmd = tool.run_command(
///     Path::new("suite/login_test.py"),
///     "emulator-5554",
///     Path::new("runs/1_logs/emulator-5554_login_test"),
/// );
/// assert_eq!(
///     cmd.to_shell_string(),
///     "airtest run suite/login_test.py --device Android:///emulator-5554 \
///      --log runs/1_logs/emulator-5554_login_test"
/// );
/// # Ok::<(), fleetrun::tool::ToolError>(())
/// ```
#[derive(Debug, Clone)]
pub struct TestTool {
    program: String,
    base_args: Vec<String>,
    config: ToolConfig,
    working_dir: Option<String>,
    run_timeout_secs: Option<u64>,
    report_timeout_secs: Option<u64>,
}

impl TestTool {
    /// Creates a tool from its configuration.
    ///
    /// # Errors
    ///
    /// [`ToolError::InvalidCommand`] if `config.command` is empty or has
    /// unbalanced quotes.
    pub fn new(config: ToolConfig) -> ToolResult<Self> {
        let mut words = shell_words::split(&config.command)
            .map_err(|e| ToolError::InvalidCommand(config.command.clone(), e.to_string()))?;
        if words.is_empty() {
            return Err(ToolError::InvalidCommand(
                config.command.clone(),
                "empty command".to_string(),
            ));
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            base_args: words,
            config,
            working_dir: None,
            run_timeout_secs: None,
            report_timeout_secs: None,
        })
    }

    /// Sets the working directory for every invocation.
    pub fn with_working_dir(mut self, dir: Option<&Path>) -> Self {
        self.working_dir = dir.map(|d| d.to_string_lossy().into_owned());
        self
    }

    /// Sets the deadlines for `run` and `report` invocations.
    pub fn with_timeouts(mut self, run_secs: u64, report_secs: u64) -> Self {
        self.run_timeout_secs = Some(run_secs);
        self.report_timeout_secs = Some(report_secs);
        self
    }

    /// Renders the device URI for `device`.
    pub fn device_uri(&self, device: &str) -> String {
        self.config.device_uri.replace("{device}", device)
    }

    fn base(&self, subcommand: &str, timeout: Option<u64>, log_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program)
            .args(self.base_args.iter().cloned())
            .arg(subcommand);
        if let Some(name) = log_dir.file_name() {
            cmd = cmd.label(name.to_string_lossy());
        }
        if let Some(dir) = &self.working_dir {
            cmd = cmd.working_dir(dir.clone());
        }
        if let Some(secs) = timeout {
            cmd = cmd.timeout(secs);
        }
        let mut env: Vec<_> = self.config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            cmd = cmd.env(key.clone(), value.clone());
        }
        cmd
    }

    /// `<tool> run <script> --device <uri> --log <log_dir>`
    pub fn run_command(&self, script: &Path, device: &str, log_dir: &Path) -> Command {
        self.base("run", self.run_timeout_secs, log_dir)
            .arg(script.to_string_lossy())
            .arg("--device")
            .arg(self.device_uri(device))
            .arg("--log")
            .arg(log_dir.to_string_lossy())
    }

    /// `<tool> report <script> --log_root <log_dir> --outfile <log_dir>/log.html --lang <lang>`
    pub fn report_command(&self, script: &Path, log_dir: &Path) -> Command {
        self.base("report", self.report_timeout_secs, log_dir)
            .arg(script.to_string_lossy())
            .arg("--log_root")
            .arg(log_dir.to_string_lossy())
            .arg("--outfile")
            .arg(log_dir.join(REPORT_FILE).to_string_lossy())
            .arg("--lang")
            .arg(self.config.lang.clone())
    }
}

/// Log file the tool writes into each task's log directory.
pub const LOG_FILE: &str = "log.txt";

/// HTML report the `report` subcommand renders next to [`LOG_FILE`].
pub const REPORT_FILE: &str = "log.html";
