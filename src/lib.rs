//! fleetrun: run UI test scripts in parallel across a fleet of devices.
//!
//! Scripts are discovered under a path, assigned to devices, and executed
//! by an external test tool (airtest by default), one worker per device.
//! Progress is checkpointed after every task so an interrupted or partly
//! failed run can be resumed, re-running only what did not pass.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Discovery** ([`discovery`]): find test scripts by file name suffix
//! - **Assignment** ([`orchestrator::scheduler`]): map scripts onto devices
//! - **Orchestrator** ([`orchestrator`]): run device queues in parallel and
//!   aggregate results
//! - **State** ([`state`]): persist and resume run progress
//! - **Tool** ([`tool`]): build and execute tool invocations
//! - **Report** ([`report`]): console and JUnit XML output
//!
//! # Example
//!
//! ```no_run
//! use fleetrun::config::{AssignmentPolicy, load_config_or_default};
//! use fleetrun::orchestrator::{Orchestrator, RunMode};
//! use fleetrun::report::NullReporter;
//! use fleetrun::tool::process::ProcessExecutor;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config_or_default(Path::new("fleetrun.toml"))?;
//!     let orchestrator = Orchestrator::new(config, ProcessExecutor::new(), NullReporter)?;
//!     let devices = vec!["emulator-5554".to_string()];
//!     let result = orchestrator
//!         .run(Path::new("suite"), &devices, AssignmentPolicy::Balance, RunMode::Fresh)
//!         .await?;
//!     println!("{}/{} passed", result.summary.success, result.summary.count);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod discovery;
pub mod orchestrator;
pub mod report;
pub mod state;
pub mod task;
pub mod tool;

// Re-export commonly used types
pub use config::{AssignmentPolicy, Config, load_config};
pub use discovery::{TestUnit, discover};
pub use orchestrator::{Orchestrator, RunError, RunMode, RunResult};
pub use report::{Reporter, SummaryRecord};
pub use state::{ProgressStore, ReportRecord, RunState};
pub use task::{DeviceQueue, Task, TaskState};
