//! Per-device worker.
//!
//! A [`DeviceRunner`] drains one [`DeviceQueue`]: it runs queued tasks one
//! after another in queue order, records each outcome on the task and
//! checkpoints it into the shared [`RunState`].
//!
//! # Outcomes
//!
//! | Executor result | Task state | Checkpoint |
//! |-----------------|------------|------------|
//! | exit code | `Finished(code)` | interim record |
//! | timeout | `Finished(-2)` | interim record |
//! | spawn/IO error | `Finished(-1)` | interim record |
//! | cancelled | `Cancelled` | none |

use std::time::Instant;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::report::Reporter;
use crate::state::{ProgressStore, ReportRecord, RunState};
use crate::task::{DeviceQueue, Task};
use crate::tool::{Executor, STATUS_INVOCATION_ERROR};

/// Runs the tasks of a device queue sequentially.
pub struct DeviceRunner<'a, E, R> {
    executor: &'a E,
    reporter: &'a R,
    store: &'a ProgressStore,
    state: &'a Mutex<RunState>,
    cancellation_token: CancellationToken,
}

impl<'a, E, R> DeviceRunner<'a, E, R>
where
    E: Executor,
    R: Reporter,
{
    pub fn new(
        executor: &'a E,
        reporter: &'a R,
        store: &'a ProgressStore,
        state: &'a Mutex<RunState>,
    ) -> Self {
        Self {
            executor,
            reporter,
            store,
            state,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Sets a cancellation token for early termination.
    ///
    /// When the token is cancelled, the running tool is killed and no
    /// further task of the queue is started.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Runs every queued task of `queue`.
    ///
    /// Returns the number of tasks that ran to completion.
    pub async fn run_queue(&self, queue: &mut DeviceQueue) -> usize {
        let mut completed = 0;
        info!("[{}] Running {} tasks", queue.device, queue.queued());

        for task in queue.tasks.iter_mut().filter(|t| t.is_queued()) {
            if self.cancellation_token.is_cancelled() {
                debug!("[{}] Cancelled, leaving {} queued", queue.device, task.log_key);
                continue;
            }

            if self.run_task(task).await {
                completed += 1;
                self.checkpoint(task).await;
            }
            self.reporter.on_task_complete(task).await;
        }

        completed
    }

    /// Runs one task; returns false if it was cancelled.
    async fn run_task(&self, task: &mut Task) -> bool {
        let Some(command) = task.command.clone() else {
            warn!("{} has no command, skipping", task.log_key);
            return false;
        };

        self.reporter.on_task_start(task).await;
        task.mark_started();
        let start = Instant::now();

        let status = match self
            .executor
            .execute(&command, &self.cancellation_token)
            .await
        {
            Ok(Some(result)) => result.exit_code,
            Ok(None) => {
                info!("[{}] {} cancelled", task.device, task.log_key);
                task.mark_cancelled();
                return false;
            }
            Err(e) => {
                error!("[{}] {} could not run: {}", task.device, task.log_key, e);
                STATUS_INVOCATION_ERROR
            }
        };

        task.mark_finished(status, start.elapsed());
        info!(
            "[{}] {} finished with status {} in {:.1}s",
            task.device,
            task.log_key,
            status,
            start.elapsed().as_secs_f64()
        );
        true
    }

    async fn checkpoint(&self, task: &Task) {
        let mut state = self.state.lock().await;
        state
            .tests
            .insert(task.log_key.clone(), ReportRecord::interim(task));
        if let Err(e) = self.store.save(&state) {
            warn!("Checkpoint after {} failed: {}", task.log_key, e);
        }
    }
}
