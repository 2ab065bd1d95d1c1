//! Scheduled work: tasks and per-device queues.
//!
//! A [`Task`] pairs one [`TestUnit`] with one device. Tasks live in the
//! [`DeviceQueue`] of their device until the run finishes; their outcome is
//! then copied into the run state under the task's `log_key`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::discovery::TestUnit;
use crate::tool::Command;

/// Lifecycle of a task within one run.
///
/// ```text
/// Pending ──► Queued ──► Running ──► Finished(code)
///    │                      │
///    └──► Skipped           └──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "status")]
pub enum TaskState {
    /// Assigned, not yet planned.
    Pending,
    /// Already succeeded in the resumed run; not executed.
    Skipped,
    /// Command built, waiting for its device.
    Queued,
    /// The tool is running.
    Running,
    /// The tool exited with this status.
    Finished(i32),
    /// The run was cancelled before the tool finished.
    Cancelled,
}

/// One (device, script) pairing.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Target device.
    pub device: String,

    /// Script to run.
    pub unit: TestUnit,

    /// `{device}_{base_name}`; unique within a run.
    pub log_key: String,

    /// Tool invocation, set when the task is queued.
    #[serde(skip)]
    pub command: Option<Command>,

    /// Current state.
    pub state: TaskState,

    /// When the tool was started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the tool exited.
    pub finished_at: Option<DateTime<Utc>>,

    /// Wall-clock time of the tool run.
    pub duration: Option<Duration>,
}

impl Task {
    /// Creates a pending task for `unit` on `device`.
    ///
    /// # Example
    ///
    /// ```
    /// use fleetrun::discovery::TestUnit;
    /// use fleetrun::task::Task;
    ///
    /// let task = Task::new("emulator-5554", TestUnit::new("suite/login_test.py"));
    /// assert_eq!(task.log_key, "emulator-5554_login_test");
    /// ```
    pub fn new(device: impl Into<String>, unit: TestUnit) -> Self {
        let device = device.into();
        let log_key = log_key(&device, &unit);
        Self {
            device,
            unit,
            log_key,
            command: None,
            state: TaskState::Pending,
            started_at: None,
            finished_at: None,
            duration: None,
        }
    }

    /// Exit status of the tool, if it ran to completion.
    pub fn status(&self) -> Option<i32> {
        match self.state {
            TaskState::Finished(code) => Some(code),
            _ => None,
        }
    }

    /// Returns true if the task is waiting to be executed.
    pub fn is_queued(&self) -> bool {
        self.state == TaskState::Queued
    }

    /// Marks the task as started now.
    pub fn mark_started(&mut self) {
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Records the tool's exit status.
    pub fn mark_finished(&mut self, status: i32, duration: Duration) {
        self.state = TaskState::Finished(status);
        self.finished_at = Some(Utc::now());
        self.duration = Some(duration);
    }

    /// Marks the task as interrupted by cancellation.
    pub fn mark_cancelled(&mut self) {
        self.state = TaskState::Cancelled;
        self.finished_at = Some(Utc::now());
    }
}

/// Builds the stable identifier of a (device, script) pair.
pub fn log_key(device: &str, unit: &TestUnit) -> String {
    format!("{}_{}", device, unit.base_name)
}

/// Directory name of a log key: `.` and `:` (common in network device
/// serials) become `_`.
///
/// ```
/// use fleetrun::task::log_dir_name;
///
/// assert_eq!(log_dir_name("10.0.0.5:5555_login_test"), "10_0_0_5_5555_login_test");
/// ```
pub fn log_dir_name(log_key: &str) -> String {
    log_key.replace(['.', ':'], "_")
}

/// Ordered tasks assigned to one device.
///
/// Execution order is insertion order and is never changed.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceQueue {
    /// Device the queue runs on.
    pub device: String,

    /// Tasks in execution order.
    pub tasks: Vec<Task>,
}

impl DeviceQueue {
    /// Creates an empty queue for `device`.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            tasks: Vec::new(),
        }
    }

    /// Appends a task for `unit`.
    pub fn push(&mut self, unit: TestUnit) {
        self.tasks.push(Task::new(self.device.clone(), unit));
    }

    /// Number of tasks waiting to run.
    pub fn queued(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_queued()).count()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
