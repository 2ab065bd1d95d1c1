//! Task assignment: mapping discovered scripts onto devices.
//!
//! # Policies
//!
//! | Policy | Tasks | Placement |
//! |--------|-------|-----------|
//! | [`Replicate`](AssignmentPolicy::Replicate) | scripts × devices | every script on every device |
//! | [`Balance`](AssignmentPolicy::Balance) | scripts | one device per script, see below |
//!
//! Balance placement, per script in discovery order:
//!
//! 1. **Affinity**: a path component equal to a device id pins the script to
//!    that device (first match in device order).
//! 2. **Unused pool**: otherwise the first device, in device order, that has
//!    not received a script yet.
//! 3. **Round-robin**: once every device was used, `devices[cursor % n]`.
//!
//! The pool and cursor are local to one [`assign`] call, so assignment is a
//! pure function of its inputs.
//!
//! # Example
//!
//! ```
//! use fleetrun::config::AssignmentPolicy;
//! use fleetrun::discovery::TestUnit;
//! use fleetrun::orchestrator::scheduler::assign;
//!
//! let devices = vec!["A".to_string(), "B".to_string()];
//! let units = vec![TestUnit::new("x_test.py"), TestUnit::new("y_test.py")];
//!
//! let assignment = assign(&devices, &units, AssignmentPolicy::Balance)?;
//! assert_eq!(assignment.queue("A").unwrap().tasks[0].log_key, "A_x_test");
//! assert_eq!(assignment.queue("B").unwrap().tasks[0].log_key, "B_y_test");
//! # Ok::<(), fleetrun::orchestrator::scheduler::AssignmentError>(())
//! ```

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::config::AssignmentPolicy;
use crate::discovery::TestUnit;
use crate::task::{DeviceQueue, Task, log_dir_name};

/// Errors that can occur while assigning scripts to devices.
#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    /// There is nothing to run on.
    #[error("No devices available")]
    NoDevices,

    /// The same device id was given twice.
    #[error("Device listed more than once: {0}")]
    DuplicateDevice(String),
}

/// Per-device queues produced by [`assign`].
///
/// Queues appear in device-list order; a device that received no script
/// has no queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Assignment {
    pub queues: Vec<DeviceQueue>,
}

impl Assignment {
    /// Returns the queue of `device`, if it received any task.
    pub fn queue(&self, device: &str) -> Option<&DeviceQueue> {
        self.queues.iter().find(|q| q.device == device)
    }

    /// Iterates over every task in queue order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.queues.iter().flat_map(|q| q.tasks.iter())
    }

    /// Iterates mutably over every task in queue order.
    pub fn tasks_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.queues.iter_mut().flat_map(|q| q.tasks.iter_mut())
    }

    /// Total number of tasks.
    pub fn len(&self) -> usize {
        self.queues.iter().map(DeviceQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log directory names shared by more than one task, sorted.
    ///
    /// Two scripts with the same file name on the same device collide, and
    /// so do keys that only differ in characters [`log_dir_name`] replaces
    /// (`a.b_test.py` and `a_b_test.py`).
    pub fn duplicate_log_keys(&self) -> Vec<String> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        for task in self.tasks() {
            *seen.entry(log_dir_name(&task.log_key)).or_default() += 1;
        }
        let mut dups: Vec<String> = seen
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(k, _)| k)
            .collect();
        dups.sort();
        dups
    }
}

/// Balance-policy bookkeeping: devices not yet used and the round-robin
/// cursor.
#[derive(Debug)]
struct BalanceState<'a> {
    devices: &'a [String],
    unused: Vec<&'a str>,
    cursor: usize,
}

impl<'a> BalanceState<'a> {
    fn new(devices: &'a [String]) -> Self {
        Self {
            devices,
            unused: devices.iter().map(String::as_str).collect(),
            cursor: 0,
        }
    }

    fn mark_used(&mut self, device: &str) {
        self.unused.retain(|d| *d != device);
    }

    fn pick(&mut self, unit: &TestUnit) -> &'a str {
        let devices = self.devices;
        if let Some(device) = devices
            .iter()
            .map(String::as_str)
            .find(|d| unit.has_path_segment(d))
        {
            self.mark_used(device);
            return device;
        }

        if !self.unused.is_empty() {
            return self.unused.remove(0);
        }

        let device = devices[self.cursor % devices.len()].as_str();
        self.cursor += 1;
        device
    }
}

/// Assigns `units` to `devices` under `policy`.
///
/// Within each queue, tasks keep discovery order.
///
/// # Errors
///
/// [`AssignmentError::NoDevices`] when `devices` is empty and
/// [`AssignmentError::DuplicateDevice`] when an id repeats.
pub fn assign(
    devices: &[String],
    units: &[TestUnit],
    policy: AssignmentPolicy,
) -> Result<Assignment, AssignmentError> {
    if devices.is_empty() {
        return Err(AssignmentError::NoDevices);
    }
    let mut distinct = BTreeSet::new();
    for device in devices {
        if !distinct.insert(device.as_str()) {
            return Err(AssignmentError::DuplicateDevice(device.clone()));
        }
    }

    let mut queues: Vec<DeviceQueue> = devices.iter().map(DeviceQueue::new).collect();

    match policy {
        AssignmentPolicy::Replicate => {
            for unit in units {
                for queue in &mut queues {
                    queue.push(unit.clone());
                }
            }
        }
        AssignmentPolicy::Balance => {
            let mut state = BalanceState::new(devices);
            for unit in units {
                let device = state.pick(unit);
                if let Some(queue) = queues.iter_mut().find(|q| q.device == device) {
                    queue.push(unit.clone());
                }
            }
        }
    }

    queues.retain(|q| !q.is_empty());
    Ok(Assignment { queues })
}
