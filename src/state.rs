//! Run state persistence.
//!
//! Every run owns two artifacts in the output directory:
//!
//! - `{run_id}_data.json`: the [`RunState`], rewritten after every task and
//!   at run end.
//! - `{run_id}_logs/`: one log directory per task, named after its log key.
//!
//! A run id is the epoch time in milliseconds at which the run started.
//! Resuming a run means loading its state file and skipping every task
//! whose recorded status is 0.
//!
//! # Example
//!
//! ```no_run
//! use fleetrun::state::{ProgressStore, new_run_id};
//! use std::path::Path;
//!
//! let store = ProgressStore::new("runs", new_run_id());
//! let mut state = store.load(Path::new("suite"), false)?;
//! state.finish();
//! store.save(&state)?;
//! # Ok::<(), fleetrun::state::StoreError>(())
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::task::{Task, log_dir_name};
use crate::tool::STATUS_INVOCATION_ERROR;

/// Result type for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or writing run state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The state file exists but is not valid run state.
    #[error("Malformed state file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize run state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to replace {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },

    /// A resume id that is neither `1753085644830` nor `1753085644830_data.json`.
    #[error("Invalid run id '{0}'")]
    InvalidRunId(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Seconds since the Unix epoch, with sub-second precision.
pub fn epoch_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Generates a run id for a new run.
pub fn new_run_id() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// Extracts the run id from a resume argument.
///
/// Accepts a bare id or the name (or path) of a state file.
///
/// # Example
///
/// ```
/// use fleetrun::state::parse_run_id;
///
/// assert_eq!(parse_run_id("1753085644830").unwrap(), "1753085644830");
/// assert_eq!(parse_run_id("runs/1753085644830_data.json").unwrap(), "1753085644830");
/// assert!(parse_run_id("latest").is_err());
/// ```
pub fn parse_run_id(value: &str) -> StoreResult<String> {
    let name = Path::new(value)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let id = name.split('_').next().unwrap_or_default();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(StoreError::InvalidRunId(value.to_string()));
    }
    Ok(id.to_string())
}

/// Directory part of a resume argument, when it names a state file by path.
///
/// ```
/// use std::path::PathBuf;
/// use fleetrun::state::state_file_dir;
///
/// assert_eq!(state_file_dir("archive/1753085644830_data.json"), Some(PathBuf::from("archive")));
/// assert_eq!(state_file_dir("1753085644830_data.json"), None);
/// ```
pub fn state_file_dir(value: &str) -> Option<PathBuf> {
    Path::new(value)
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

/// Outcome of one task, keyed by its log key in [`RunState::tests`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    /// 0 on success; the tool's exit code or a negative sentinel otherwise.
    pub status: i32,

    /// Exit code of the `run` invocation.
    #[serde(default)]
    pub exec_status: Option<i32>,

    /// Exit code of the `report` invocation; `None` while pending.
    #[serde(default)]
    pub report_status: Option<i32>,

    #[serde(default)]
    pub device: String,

    #[serde(default)]
    pub script: String,

    /// HTML report path, empty when no report exists.
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub run_command: String,

    #[serde(default)]
    pub report_command: String,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// Seconds the `run` invocation took.
    #[serde(default)]
    pub spend_time: Option<f64>,

    /// Epoch seconds at which this record was written.
    #[serde(default)]
    pub path_time: f64,
}

impl ReportRecord {
    fn from_task(task: &Task, status: i32) -> Self {
        Self {
            status,
            exec_status: task.status(),
            report_status: None,
            device: task.device.clone(),
            script: task.unit.path.to_string_lossy().into_owned(),
            path: String::new(),
            run_command: task
                .command
                .as_ref()
                .map(|c| c.to_shell_string())
                .unwrap_or_default(),
            report_command: String::new(),
            started_at: task.started_at,
            finished_at: task.finished_at,
            spend_time: task.duration.map(|d| d.as_secs_f64()),
            path_time: epoch_secs(),
        }
    }

    /// Checkpoint written right after the tool exits; the report is pending.
    pub fn interim(task: &Task) -> Self {
        Self::from_task(task, task.status().unwrap_or(STATUS_INVOCATION_ERROR))
    }

    /// Final record for a task whose report was generated.
    pub fn reported(task: &Task, report_command: String, report_status: i32, path: &Path) -> Self {
        Self {
            report_status: Some(report_status),
            report_command,
            path: path.to_string_lossy().into_owned(),
            ..Self::interim(task)
        }
    }

    /// Final record for a task that left no log behind.
    pub fn missing_log(task: &Task) -> Self {
        Self::from_task(task, STATUS_INVOCATION_ERROR)
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// Persisted state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Epoch seconds at which the current invocation started.
    pub start: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spend_time: Option<f64>,

    /// Path the run was started on.
    pub script: String,

    /// Results by log key.
    #[serde(default)]
    pub tests: BTreeMap<String, ReportRecord>,

    /// File name of the state file.
    pub data_json: String,

    /// File name of the run report.
    #[serde(alias = "report_html")]
    pub report_file: String,
}

impl RunState {
    fn fresh(script: &Path, run_id: &str) -> Self {
        Self {
            start: epoch_secs(),
            end: None,
            spend_time: None,
            script: script.to_string_lossy().into_owned(),
            tests: BTreeMap::new(),
            data_json: format!("{}_data.json", run_id),
            report_file: format!("{}_junit.xml", run_id),
        }
    }

    /// Returns true if `log_key` already succeeded.
    pub fn succeeded(&self, log_key: &str) -> bool {
        self.tests.get(log_key).is_some_and(ReportRecord::is_success)
    }

    /// Stamps the end of the run.
    pub fn finish(&mut self) {
        let end = epoch_secs();
        self.end = Some(end);
        self.spend_time = Some(end - self.start);
    }
}

/// Reads and writes the state file and log tree of one run.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    output_dir: PathBuf,
    run_id: String,
}

impl ProgressStore {
    pub fn new(output_dir: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `{output_dir}/{run_id}_data.json`
    pub fn data_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_data.json", self.run_id))
    }

    /// `{output_dir}/{run_id}_logs`
    pub fn logs_root(&self) -> PathBuf {
        self.output_dir.join(format!("{}_logs", self.run_id))
    }

    /// `{output_dir}/{run_id}_junit.xml`
    pub fn junit_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_junit.xml", self.run_id))
    }

    /// Log directory of `log_key`, without creating it.
    ///
    /// See [`log_dir_name`].
    pub fn log_dir_path(&self, log_key: &str) -> PathBuf {
        self.logs_root().join(log_dir_name(log_key))
    }

    /// Log directory of `log_key`, created if missing.
    pub fn log_dir(&self, log_key: &str) -> StoreResult<PathBuf> {
        let dir = self.log_dir_path(log_key);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(dir)
    }

    /// Loads the state of this run.
    ///
    /// Without `resume`, or when no state file exists yet, the log tree is
    /// wiped and a fresh state is returned. Otherwise the saved state is
    /// returned with `start` reset to now and its results intact.
    ///
    /// # Errors
    ///
    /// [`StoreError::Malformed`] if the state file cannot be parsed.
    pub fn load(&self, script: &Path, resume: bool) -> StoreResult<RunState> {
        let path = self.data_path();

        if resume {
            if path.is_file() {
                debug!("Loading run state from {}", path.display());
                let contents = fs::read_to_string(&path).map_err(io_error(&path))?;
                let mut state: RunState =
                    serde_json::from_str(&contents).map_err(|source| StoreError::Malformed {
                        path: path.clone(),
                        source,
                    })?;
                state.start = epoch_secs();
                state.end = None;
                state.spend_time = None;
                state.data_json = format!("{}_data.json", self.run_id);
                state.report_file = format!("{}_junit.xml", self.run_id);
                info!(
                    "Resuming run {} with {} recorded results",
                    self.run_id,
                    state.tests.len()
                );
                return Ok(state);
            }
            warn!(
                "No state file at {}, starting run {} from scratch",
                path.display(),
                self.run_id
            );
        }

        self.clear_logs()?;
        Ok(RunState::fresh(script, &self.run_id))
    }

    fn clear_logs(&self) -> StoreResult<()> {
        let logs = self.logs_root();
        if logs.exists() {
            debug!("Removing {}", logs.display());
            fs::remove_dir_all(&logs).map_err(io_error(&logs))?;
        }
        fs::create_dir_all(&logs).map_err(io_error(&logs))
    }

    /// Atomically replaces the state file with `state`.
    pub fn save(&self, state: &RunState) -> StoreResult<()> {
        let path = self.data_path();
        fs::create_dir_all(&self.output_dir).map_err(io_error(&self.output_dir))?;

        let contents = serde_json::to_string_pretty(state)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.output_dir)
            .map_err(io_error(&self.output_dir))?;
        tmp.write_all(contents.as_bytes()).map_err(io_error(tmp.path()))?;
        tmp.persist(&path).map_err(|source| StoreError::Persist {
            path: path.clone(),
            source,
        })?;

        debug!(
            "Saved {} results to {}",
            state.tests.len(),
            path.display()
        );
        Ok(())
    }
}
