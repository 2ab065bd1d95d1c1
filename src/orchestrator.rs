//! Run orchestration.
//!
//! This module ties discovery, assignment, execution, and aggregation
//! together into one run.
//!
//! # Architecture
//!
//! ```text
//!   discover()            assign()                 ProgressStore
//!       │                    │                          │
//!       ▼                    ▼                          │ load()
//!  Vec<TestUnit> ──────► Assignment ◄──── skip passed ──┤
//!                            │                          │
//!                            │ one DeviceRunner per queue
//!                            ▼                          │
//!                 ┌──────────┼──────────┐               │
//!              device A   device B   device C           │
//!              (serial)   (serial)   (serial)           │
//!                 └──────────┼──────────┘               │
//!                            │ checkpoint ─────────────►│ save()
//!                            ▼                          │
//!                    report generation                  │
//!                            │                          │
//!                            ▼                          │
//!                 RunState + SummaryRecord ────────────►│ save()
//!                            │
//!                            ▼
//!                        Reporter
//! ```
//!
//! # Execution Flow
//!
//! 1. **Discovery**: find scripts under the given path
//! 2. **Assignment**: map scripts to device queues under the policy
//! 3. **Planning**: skip tasks that already passed (resume), create log
//!    directories and build the tool commands
//! 4. **Execution**: one worker per device, workers in parallel, tasks in
//!    a worker strictly sequential
//! 5. **Aggregation**: generate a report for every finished task
//! 6. **Reporting**: persist the state and notify reporters
//!
//! # Example
//!
//! ```no_run
//! use fleetrun::config::{AssignmentPolicy, load_config};
//! use fleetrun::orchestrator::{Orchestrator, RunMode};
//! use fleetrun::report::ConsoleReporter;
//! use fleetrun::tool::process::ProcessExecutor;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(Path::new("fleetrun.toml"))?;
//!     let orchestrator =
//!         Orchestrator::new(config, ProcessExecutor::new(), ConsoleReporter::new(false))?;
//!
//!     let devices = vec!["66J5T19730001281".to_string(), "YWT0222A10000129".to_string()];
//!     let result = orchestrator
//!         .run(Path::new("suite"), &devices, AssignmentPolicy::Balance, RunMode::Fresh)
//!         .await?;
//!
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod runner;
pub mod scheduler;

use std::path::Path;

use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AssignmentPolicy, Config};
use crate::discovery::{DiscoveryError, discover};
use crate::report::{Reporter, SummaryRecord};
use crate::state::{
    ProgressStore, ReportRecord, RunState, StoreError, new_run_id, parse_run_id,
    state_file_dir,
};
use crate::task::{Task, TaskState};
use crate::tool::{Executor, LOG_FILE, REPORT_FILE, STATUS_INVOCATION_ERROR, TestTool, ToolError};

pub use runner::DeviceRunner;
pub use scheduler::{Assignment, AssignmentError, assign};

/// Errors that abort a run.
///
/// Task failures are never errors; they are recorded in the run state.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Assignment(#[from] AssignmentError),

    /// Two tasks would share a log directory.
    #[error("Tasks share log directories: {}", .0.join(", "))]
    DuplicateLogKey(Vec<String>),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Whether a run starts over or continues a previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// New run id; every task runs.
    Fresh,

    /// Continue the given run, skipping tasks that already passed.
    ///
    /// Accepts `1753085644830`, `1753085644830_data.json` or a path to the
    /// state file; a path's directory replaces the configured output dir.
    Resume(String),
}

/// Outcome of a completed (or cancelled) run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every recorded task passed |
/// | 1 | Some tasks failed |
/// | 130 | The run was cancelled |
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,

    pub summary: SummaryRecord,

    /// Final persisted state.
    pub state: RunState,

    /// Tasks executed by this invocation.
    pub executed: usize,

    /// Tasks skipped because they passed in an earlier invocation.
    pub skipped: usize,

    pub cancelled: bool,
}

impl RunResult {
    /// Returns `true` if the run finished and every task passed.
    pub fn success(&self) -> bool {
        !self.cancelled && self.summary.is_clean()
    }

    /// Returns an appropriate process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            130
        } else if self.summary.is_clean() {
            0
        } else {
            1
        }
    }
}

/// Coordinates a run across a fleet of devices.
///
/// # Type Parameters
///
/// - `E`: executes tool invocations
/// - `R`: receives progress events
pub struct Orchestrator<E, R> {
    config: Config,
    tool: TestTool,
    executor: E,
    reporter: R,
    cancellation_token: CancellationToken,
}

impl<E, R> Orchestrator<E, R>
where
    E: Executor,
    R: Reporter,
{
    /// Creates an orchestrator from configuration.
    ///
    /// # Errors
    ///
    /// [`RunError::Tool`] if the configured tool command is invalid.
    pub fn new(config: Config, executor: E, reporter: R) -> Result<Self, RunError> {
        let tool = TestTool::new(config.tool.clone())?
            .with_working_dir(config.fleetrun.working_dir.as_deref())
            .with_timeouts(
                config.fleetrun.task_timeout_secs,
                config.fleetrun.report_timeout_secs,
            );
        Ok(Self {
            config,
            tool,
            executor,
            reporter,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Sets the token that cancels the run.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Discovers scripts under `root` and assigns them to `devices`.
    ///
    /// # Errors
    ///
    /// Discovery and assignment errors, and [`RunError::DuplicateLogKey`]
    /// if two tasks would share a log key.
    pub fn plan(
        &self,
        root: &Path,
        devices: &[String],
        policy: AssignmentPolicy,
    ) -> Result<Assignment, RunError> {
        let units = discover(root, &self.config.discovery.suffix)?;
        if units.is_empty() {
            warn!("No test scripts found under {}", root.display());
        }

        let assignment = assign(devices, &units, policy)?;
        let dups = assignment.duplicate_log_keys();
        if !dups.is_empty() {
            return Err(RunError::DuplicateLogKey(dups));
        }

        info!(
            "Assigned {} scripts as {} tasks on {} devices",
            units.len(),
            assignment.len(),
            assignment.queues.len()
        );
        Ok(assignment)
    }

    /// Runs every script under `root` on `devices`.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only: discovery, assignment, log directory
    /// creation, and the final state save. Per-task failures are recorded
    /// in the returned state.
    pub async fn run(
        &self,
        root: &Path,
        devices: &[String],
        policy: AssignmentPolicy,
        mode: RunMode,
    ) -> Result<RunResult, RunError> {
        let output_dir = &self.config.fleetrun.output_dir;
        let (run_id, resume, output_dir) = match &mode {
            RunMode::Fresh => (new_run_id(), false, output_dir.clone()),
            RunMode::Resume(value) => (
                parse_run_id(value)?,
                true,
                state_file_dir(value).unwrap_or_else(|| output_dir.clone()),
            ),
        };
        info!("Run {} on {}", run_id, root.display());

        let mut assignment = self.plan(root, devices, policy)?;
        let store = ProgressStore::new(&output_dir, run_id.clone());
        let state = store.load(root, resume)?;

        let mut skipped = 0;
        for task in assignment.tasks_mut() {
            if resume && state.succeeded(&task.log_key) {
                info!("Skip {}, already passed", task.log_key);
                task.state = TaskState::Skipped;
                skipped += 1;
                continue;
            }
            let log_dir = store.log_dir(&task.log_key)?;
            task.command = Some(
                self.tool
                    .run_command(&task.unit.path, &task.device, &log_dir),
            );
            task.state = TaskState::Queued;
        }

        self.reporter.on_plan_complete(&assignment).await;

        let queued: usize = assignment.queues.iter().map(|q| q.queued()).sum();
        let state = Mutex::new(state);
        let executed = if queued == 0 {
            info!("Nothing to run");
            0
        } else {
            self.execute(&mut assignment, &store, &state).await
        };

        let mut state = state.into_inner();
        let cancelled = self.cancellation_token.is_cancelled();
        if cancelled {
            warn!("Run {} cancelled, skipping report generation", run_id);
        } else {
            self.generate_reports(&assignment, &store, &mut state).await;
        }

        state.finish();
        store.save(&state)?;
        let summary = SummaryRecord::from_state(&state);
        info!(
            "Run {} done: {}/{} passed",
            run_id, summary.success, summary.count
        );
        self.reporter.on_run_complete(&summary, &state).await;

        Ok(RunResult {
            run_id,
            summary,
            state,
            executed,
            skipped,
            cancelled,
        })
    }

    /// Drains every queue with queued tasks, one worker per device.
    async fn execute(
        &self,
        assignment: &mut Assignment,
        store: &ProgressStore,
        state: &Mutex<RunState>,
    ) -> usize {
        let semaphore = self
            .config
            .fleetrun
            .max_parallel
            .filter(|n| *n > 0)
            .map(Semaphore::new);
        let executed = std::sync::atomic::AtomicUsize::new(0);

        // Execute queues concurrently using scoped spawns (no 'static required)
        tokio_scoped::scope(|scope| {
            for queue in assignment.queues.iter_mut().filter(|q| q.queued() > 0) {
                let runner = DeviceRunner::new(&self.executor, &self.reporter, store, state)
                    .with_cancellation_token(self.cancellation_token.clone());
                let semaphore = semaphore.as_ref();
                let executed = &executed;

                scope.spawn(async move {
                    let _permit = match semaphore {
                        Some(s) => s.acquire().await.ok(),
                        None => None,
                    };
                    let n = runner.run_queue(queue).await;
                    executed.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
                });
            }
        });

        executed.into_inner()
    }

    /// Replaces the interim record of every finished task with its final one.
    async fn generate_reports(
        &self,
        assignment: &Assignment,
        store: &ProgressStore,
        state: &mut RunState,
    ) {
        let finished: Vec<&Task> = assignment
            .tasks()
            .filter(|t| matches!(t.state, TaskState::Finished(_)))
            .collect();
        debug!("Generating {} reports", finished.len());

        let records = join_all(
            finished
                .into_iter()
                .map(|task| self.report_task(task, store)),
        )
        .await;

        for (log_key, record) in records {
            state.tests.insert(log_key, record);
        }
    }

    async fn report_task(&self, task: &Task, store: &ProgressStore) -> (String, ReportRecord) {
        let log_dir = store.log_dir_path(&task.log_key);
        let log = log_dir.join(LOG_FILE);
        if !log.is_file() {
            warn!("Report build failed, {} not found", log.display());
            return (task.log_key.clone(), ReportRecord::missing_log(task));
        }

        let command = self.tool.report_command(&task.unit.path, &log_dir);
        let report_status = match self
            .executor
            .execute(&command, &self.cancellation_token)
            .await
        {
            Ok(Some(result)) => result.exit_code,
            Ok(None) => STATUS_INVOCATION_ERROR,
            Err(e) => {
                warn!("Report for {} failed: {}", task.log_key, e);
                STATUS_INVOCATION_ERROR
            }
        };
        if report_status != 0 {
            warn!(
                "Report for {} exited with {}",
                task.log_key, report_status
            );
        }

        let record = ReportRecord::reported(
            task,
            command.to_shell_string(),
            report_status,
            &log_dir.join(REPORT_FILE),
        );
        (task.log_key.clone(), record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::NullReporter;
    use crate::tool::{Command, ExecResult, ToolResult};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[derive(Debug, Clone)]
    struct Call {
        subcommand: String,
        device: Option<String>,
        script: String,
    }

    /// Stands in for the test tool: `run` writes `log.txt` into `--log`
    /// and exits with the configured code, `report` exits 0.
    #[derive(Default)]
    struct FakeTool {
        exit_codes: HashMap<String, i32>,
        no_log: HashSet<String>,
        hang: HashSet<String>,
        delay: Duration,
        calls: StdMutex<Vec<Call>>,
    }

    impl FakeTool {
        fn exit(mut self, base_name: &str, code: i32) -> Self {
            self.exit_codes.insert(base_name.to_string(), code);
            self
        }

        fn calls(&self, subcommand: &str) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.subcommand == subcommand)
                .cloned()
                .collect()
        }
    }

    fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[async_trait]
    impl Executor for FakeTool {
        async fn execute(
            &self,
            cmd: &Command,
            cancel: &CancellationToken,
        ) -> ToolResult<Option<ExecResult>> {
            let subcommand = cmd.args[0].clone();
            let script = cmd.args[1].clone();
            let base_name = Path::new(&script)
                .file_stem()
                .unwrap()
                .to_string_lossy()
                .into_owned();
            self.calls.lock().unwrap().push(Call {
                subcommand: subcommand.clone(),
                device: flag(&cmd.args, "--device").map(|d| d.replace("Android:///", "")),
                script: base_name.clone(),
            });

            let mut code = 0;
            if subcommand == "run" {
                if self.hang.contains(&base_name) {
                    cancel.cancelled().await;
                    return Ok(None);
                }
                tokio::time::sleep(self.delay).await;
                if !self.no_log.contains(&base_name) {
                    let log_dir = PathBuf::from(flag(&cmd.args, "--log").unwrap());
                    std::fs::write(log_dir.join(LOG_FILE), "log").unwrap();
                }
                code = self.exit_codes.get(&base_name).copied().unwrap_or(0);
            }
            Ok(Some(ExecResult {
                exit_code: code,
                stdout: String::new(),
                stderr: String::new(),
                duration: self.delay,
            }))
        }
    }

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new(scripts: &[&str]) -> Self {
            let dir = TempDir::new().unwrap();
            for script in scripts {
                let path = dir.path().join("suite").join(script);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, "# test\n").unwrap();
            }
            Self { dir }
        }

        fn suite(&self) -> PathBuf {
            self.dir.path().join("suite")
        }

        fn config(&self) -> Config {
            let mut config = Config::default();
            config.fleetrun.output_dir = self.dir.path().join("runs");
            config
        }

        fn orchestrator(&self, tool: FakeTool) -> Orchestrator<FakeTool, NullReporter> {
            Orchestrator::new(self.config(), tool, NullReporter).unwrap()
        }
    }

    fn devices(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_devices_two_scripts_end_to_end() {
        let fx = Fixture::new(&["x_test.py", "y_test.py"]);
        let orch = fx.orchestrator(FakeTool::default());

        let result = orch
            .run(&fx.suite(), &devices(&["A", "B"]), AssignmentPolicy::Balance, RunMode::Fresh)
            .await
            .unwrap();

        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.summary.count, 2);
        assert_eq!(result.summary.success, 2);
        assert_eq!(result.executed, 2);

        let keys: Vec<_> = result.state.tests.keys().cloned().collect();
        assert_eq!(keys, vec!["A_x_test", "B_y_test"]);
        let record = &result.state.tests["A_x_test"];
        assert_eq!(record.report_status, Some(0));
        assert!(record.path.ends_with("A_x_test/log.html"));
        assert!(record.run_command.contains("--device Android:///A"));

        let store = ProgressStore::new(fx.dir.path().join("runs"), result.run_id.clone());
        assert!(store.data_path().is_file());
        assert_eq!(orch.executor.calls("report").len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_is_recorded_not_raised() {
        let fx = Fixture::new(&["x_test.py", "y_test.py"]);
        let orch = fx.orchestrator(FakeTool::default().exit("y_test", 1));

        let result = orch
            .run(&fx.suite(), &devices(&["A"]), AssignmentPolicy::Balance, RunMode::Fresh)
            .await
            .unwrap();

        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.summary.failed(), 1);
        assert_eq!(result.state.tests["A_y_test"].status, 1);
        assert_eq!(result.state.tests["A_y_test"].report_status, Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resume_reruns_only_failures() {
        let fx = Fixture::new(&["x_test.py", "y_test.py"]);
        let first = fx
            .orchestrator(FakeTool::default().exit("y_test", 1))
            .run(&fx.suite(), &devices(&["A"]), AssignmentPolicy::Balance, RunMode::Fresh)
            .await
            .unwrap();
        assert_eq!(first.exit_code(), 1);

        let orch = fx.orchestrator(FakeTool::default());
        let second = orch
            .run(
                &fx.suite(),
                &devices(&["A"]),
                AssignmentPolicy::Balance,
                RunMode::Resume(format!("{}_data.json", first.run_id)),
            )
            .await
            .unwrap();

        assert_eq!(second.run_id, first.run_id);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.executed, 1);
        let runs: Vec<_> = orch.executor.calls("run").into_iter().map(|c| c.script).collect();
        assert_eq!(runs, vec!["y_test"]);
        assert_eq!(second.exit_code(), 0);
        assert_eq!(second.state.tests.len(), 2);
        // The passed record survives untouched.
        let (before, after) = (&first.state.tests["A_x_test"], &second.state.tests["A_x_test"]);
        assert_eq!(after.status, 0);
        assert_eq!(after.path, before.path);
        assert_eq!(after.finished_at, before.finished_at);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resume_from_state_file_path_uses_its_directory() {
        let fx = Fixture::new(&["x_test.py", "y_test.py"]);
        let first = fx
            .orchestrator(FakeTool::default().exit("y_test", 1))
            .run(&fx.suite(), &devices(&["A"]), AssignmentPolicy::Balance, RunMode::Fresh)
            .await
            .unwrap();

        let mut config = fx.config();
        config.fleetrun.output_dir = fx.dir.path().join("elsewhere");
        let orch = Orchestrator::new(config, FakeTool::default(), NullReporter).unwrap();
        let state_file = fx.dir.path().join("runs").join(format!("{}_data.json", first.run_id));
        let second = orch
            .run(
                &fx.suite(),
                &devices(&["A"]),
                AssignmentPolicy::Balance,
                RunMode::Resume(state_file.to_string_lossy().into_owned()),
            )
            .await
            .unwrap();

        assert_eq!(second.skipped, 1);
        let runs: Vec<_> = orch.executor.calls("run").into_iter().map(|c| c.script).collect();
        assert_eq!(runs, vec!["y_test"]);
        assert!(fx.dir.path().join("runs").join(format!("{}_logs", first.run_id)).join("A_x_test").is_dir());
        assert!(!fx.dir.path().join("elsewhere").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resume_of_clean_run_is_a_no_op() {
        let fx = Fixture::new(&["x_test.py", "y_test.py"]);
        let first = fx
            .orchestrator(FakeTool::default())
            .run(&fx.suite(), &devices(&["A", "B"]), AssignmentPolicy::Balance, RunMode::Fresh)
            .await
            .unwrap();

        let orch = fx.orchestrator(FakeTool::default());
        let second = orch
            .run(
                &fx.suite(),
                &devices(&["A", "B"]),
                AssignmentPolicy::Balance,
                RunMode::Resume(first.run_id.clone()),
            )
            .await
            .unwrap();

        assert!(orch.executor.calls.lock().unwrap().is_empty());
        assert_eq!(second.executed, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(
            second.state.tests.keys().collect::<Vec<_>>(),
            first.state.tests.keys().collect::<Vec<_>>()
        );
        assert!(second.state.tests.values().all(|r| r.is_success()));
        assert_eq!(second.exit_code(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resume_without_state_runs_everything() {
        let fx = Fixture::new(&["x_test.py", "y_test.py"]);
        let orch = fx.orchestrator(FakeTool::default());

        let result = orch
            .run(
                &fx.suite(),
                &devices(&["A"]),
                AssignmentPolicy::Balance,
                RunMode::Resume("1753085644830".into()),
            )
            .await
            .unwrap();

        assert_eq!(result.run_id, "1753085644830");
        assert_eq!(result.executed, 2);
        assert_eq!(result.skipped, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_missing_log_yields_failure_record() {
        let fx = Fixture::new(&["x_test.py"]);
        let mut tool = FakeTool::default();
        tool.no_log.insert("x_test".into());
        let orch = fx.orchestrator(tool);

        let result = orch
            .run(&fx.suite(), &devices(&["A"]), AssignmentPolicy::Balance, RunMode::Fresh)
            .await
            .unwrap();

        let record = &result.state.tests["A_x_test"];
        assert_eq!(record.status, STATUS_INVOCATION_ERROR);
        assert_eq!(record.exec_status, Some(0));
        assert_eq!(record.path, "");
        assert_eq!(result.summary.success, 0);
        assert!(orch.executor.calls("report").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_devices_run_in_parallel() {
        let fx = Fixture::new(&[
            "t1_test.py",
            "t2_test.py",
            "t3_test.py",
            "t4_test.py",
            "t5_test.py",
            "t6_test.py",
        ]);
        let tool = FakeTool {
            delay: Duration::from_millis(300),
            ..Default::default()
        };
        let orch = fx.orchestrator(tool);

        let started = Instant::now();
        let result = orch
            .run(
                &fx.suite(),
                &devices(&["A", "B", "C"]),
                AssignmentPolicy::Balance,
                RunMode::Fresh,
            )
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.executed, 6);
        // Two tasks per device back to back; serial would take 1.8s.
        assert!(elapsed >= Duration::from_millis(600), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_parallel_limits_workers() {
        let fx = Fixture::new(&["x_test.py", "y_test.py"]);
        let mut config = fx.config();
        config.fleetrun.max_parallel = Some(1);
        let tool = FakeTool {
            delay: Duration::from_millis(200),
            ..Default::default()
        };
        let orch = Orchestrator::new(config, tool, NullReporter).unwrap();

        let started = Instant::now();
        orch.run(&fx.suite(), &devices(&["A", "B"]), AssignmentPolicy::Balance, RunMode::Fresh)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replicate_runs_in_queue_order_per_device() {
        let fx = Fixture::new(&["a_test.py", "b_test.py", "c_test.py"]);
        let orch = fx.orchestrator(FakeTool::default());

        let result = orch
            .run(
                &fx.suite(),
                &devices(&["A", "B"]),
                AssignmentPolicy::Replicate,
                RunMode::Fresh,
            )
            .await
            .unwrap();
        assert_eq!(result.summary.count, 6);

        let runs = orch.executor.calls("run");
        for device in ["A", "B"] {
            let order: Vec<_> = runs
                .iter()
                .filter(|c| c.device.as_deref() == Some(device))
                .map(|c| c.script.as_str())
                .collect();
            assert_eq!(order, vec!["a_test", "b_test", "c_test"]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_log_keys_rejected() {
        let fx = Fixture::new(&["one/x_test.py", "two/x_test.py"]);
        let orch = fx.orchestrator(FakeTool::default());

        let err = orch
            .run(&fx.suite(), &devices(&["A"]), AssignmentPolicy::Balance, RunMode::Fresh)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::DuplicateLogKey(keys) if keys == vec!["A_x_test"]));
        assert!(orch.executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_log_directory_collisions_rejected() {
        let fx = Fixture::new(&["a.b_test.py", "a_b_test.py"]);
        let mut tool = FakeTool::default();
        tool.no_log.insert("a_b_test".to_string());
        let orch = fx.orchestrator(tool);

        let err = orch
            .run(&fx.suite(), &devices(&["A"]), AssignmentPolicy::Balance, RunMode::Fresh)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::DuplicateLogKey(keys) if keys == vec!["A_a_b_test"]));
        assert!(orch.executor.calls.lock().unwrap().is_empty());
        assert!(!fx.dir.path().join("runs").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_missing_root_is_an_error() {
        let fx = Fixture::new(&[]);
        let orch = fx.orchestrator(FakeTool::default());
        let err = orch
            .run(
                &fx.dir.path().join("nope"),
                &devices(&["A"]),
                AssignmentPolicy::Balance,
                RunMode::Fresh,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Discovery(DiscoveryError::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelled_task_left_out_of_state() {
        let fx = Fixture::new(&["x_test.py", "y_test.py"]);
        let mut tool = FakeTool::default();
        tool.hang.insert("y_test".into());
        let token = CancellationToken::new();
        let orch = fx.orchestrator(tool).with_cancellation_token(token.clone());

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = orch
            .run(&fx.suite(), &devices(&["A", "B"]), AssignmentPolicy::Balance, RunMode::Fresh)
            .await
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.exit_code(), 130);
        assert!(result.state.tests.contains_key("A_x_test"));
        assert!(!result.state.tests.contains_key("B_y_test"));
    }
}
