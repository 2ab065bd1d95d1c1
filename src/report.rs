//! Run reporting.
//!
//! Reporters receive events while a run progresses and the final
//! [`SummaryRecord`] when it completes. Two implementations ship with the
//! crate:
//!
//! - [`ConsoleReporter`]: progress bar and colored summary on the terminal.
//! - [`JUnitReporter`]: a JUnit XML file with one test case per result.
//!
//! Several reporters are combined with [`MultiReporter`].

pub mod junit;

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Local, TimeZone};
use serde::Serialize;

use crate::orchestrator::scheduler::Assignment;
use crate::state::{RunState, epoch_secs};
use crate::task::{Task, TaskState};

pub use junit::JUnitReporter;

/// Aggregate figures of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRecord {
    /// Local start time, `%Y-%m-%d %H:%M:%S`.
    pub start: String,

    /// Seconds from start to summary.
    pub elapsed: f64,

    /// Number of recorded results.
    pub count: usize,

    /// Results with status 0.
    pub success: usize,
}

impl SummaryRecord {
    /// Summarizes every result recorded in `state`.
    pub fn from_state(state: &RunState) -> Self {
        let end = state.end.unwrap_or_else(epoch_secs);
        Self {
            start: format_local(state.start),
            elapsed: end - state.start,
            count: state.tests.len(),
            success: state.tests.values().filter(|r| r.is_success()).count(),
        }
    }

    pub fn failed(&self) -> usize {
        self.count - self.success
    }

    /// True when every recorded result succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }
}

fn format_local(epoch_secs: f64) -> String {
    let millis = (epoch_secs * 1000.0) as i64;
    match Local.timestamp_millis_opt(millis).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::new(),
    }
}

/// Receives events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once tasks are planned, before any of them runs.
    async fn on_plan_complete(&self, assignment: &Assignment);

    /// Called when a task starts running.
    async fn on_task_start(&self, task: &Task);

    /// Called when a task finishes or is cancelled.
    async fn on_task_complete(&self, task: &Task);

    /// Called after results are aggregated and saved.
    async fn on_run_complete(&self, summary: &SummaryRecord, state: &RunState);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_plan_complete(&self, _assignment: &Assignment) {}
    async fn on_task_start(&self, _task: &Task) {}
    async fn on_task_complete(&self, _task: &Task) {}
    async fn on_run_complete(&self, _summary: &SummaryRecord, _state: &RunState) {}
}

/// Forwards every event to each contained reporter, in insertion order.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_plan_complete(&self, assignment: &Assignment) {
        for reporter in &self.reporters {
            reporter.on_plan_complete(assignment).await;
        }
    }

    async fn on_task_start(&self, task: &Task) {
        for reporter in &self.reporters {
            reporter.on_task_start(task).await;
        }
    }

    async fn on_task_complete(&self, task: &Task) {
        for reporter in &self.reporters {
            reporter.on_task_complete(task).await;
        }
    }

    async fn on_run_complete(&self, summary: &SummaryRecord, state: &RunState) {
        for reporter in &self.reporters {
            reporter.on_run_complete(summary, state).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn with_bar(&self, f: impl FnOnce(&indicatif::ProgressBar)) {
        if let Ok(guard) = self.progress.lock()
            && let Some(pb) = guard.as_ref()
        {
            f(pb);
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_plan_complete(&self, assignment: &Assignment) {
        let queued = assignment.tasks().filter(|t| t.is_queued()).count();
        let skipped = assignment
            .tasks()
            .filter(|t| t.state == TaskState::Skipped)
            .count();
        println!(
            "Planned {} tasks on {} devices ({} already passed)",
            queued,
            assignment.queues.len(),
            skipped
        );

        let pb = indicatif::ProgressBar::new(queued as u64);
        let style = indicatif::ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);

        if let Ok(mut guard) = self.progress.lock() {
            *guard = Some(pb);
        }
    }

    async fn on_task_start(&self, task: &Task) {
        if self.verbose {
            self.with_bar(|pb| pb.println(format!("Running: {}", task.log_key)));
        }
    }

    async fn on_task_complete(&self, task: &Task) {
        self.with_bar(|pb| {
            let status = match task.state {
                TaskState::Finished(0) => console::style("PASS").green(),
                TaskState::Finished(_) => console::style("FAIL").red(),
                TaskState::Cancelled => console::style("STOP").yellow(),
                _ => return,
            };
            pb.inc(1);
            if self.verbose || task.status() != Some(0) {
                pb.println(format!("{} {}", status, task.log_key));
            }
        });
    }

    async fn on_run_complete(&self, summary: &SummaryRecord, state: &RunState) {
        if let Ok(mut guard) = self.progress.lock()
            && let Some(pb) = guard.take()
        {
            pb.finish_and_clear();
        }
        print_summary(summary, state);
    }
}

/// Prints a summary of run results to the console.
pub fn print_summary(summary: &SummaryRecord, state: &RunState) {
    println!();
    println!("Run Results:");
    println!("  Started:  {}", summary.start);
    println!("  Total:    {}", summary.count);
    println!("  Passed:   {}", console::style(summary.success).green());
    println!("  Failed:   {}", console::style(summary.failed()).red());
    println!("  Duration: {:.3}s", summary.elapsed);
    println!("  State:    {}", state.data_json);

    println!();
    if summary.is_clean() {
        println!("{}", console::style("All tasks passed!").green().bold());
        return;
    }

    println!("{}", console::style("Some tasks failed.").red().bold());
    println!();
    println!("Failed tasks:");
    for (log_key, record) in state.tests.iter().filter(|(_, r)| !r.is_success()) {
        println!("  - {} (status {})", log_key, record.status);
        if !record.path.is_empty() {
            println!("    {}", console::style(&record.path).dim());
        }
    }
}
