//! Device enumeration.
//!
//! A device is an opaque identifier (an adb serial, usually). Devices are
//! either listed explicitly or enumerated from `adb devices`; in both cases
//! the order of the returned list is the order the scheduler sees.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

/// Result type for device enumeration.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur while enumerating devices.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The enumeration command could not be run.
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The configured adb command cannot be split into words.
    #[error("Invalid adb command '{0}': {1}")]
    InvalidCommand(String, String),

    /// The enumeration command ran but reported failure.
    #[error("{program} devices failed: {stderr}")]
    CommandFailed { program: String, stderr: String },
}

/// Supplies the list of devices to run on.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// Returns device identifiers in a stable order.
    async fn devices(&self) -> DeviceResult<Vec<String>>;

    /// Name used in logs.
    fn name(&self) -> &'static str;
}

/// A fixed list of devices.
#[derive(Debug, Clone)]
pub struct StaticDevices {
    devices: Vec<String>,
}

impl StaticDevices {
    pub fn new(devices: Vec<String>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceSource for StaticDevices {
    async fn devices(&self) -> DeviceResult<Vec<String>> {
        Ok(self.devices.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Enumerates attached devices with `adb devices`.
///
/// Only devices in the `device` state are returned; `offline` and
/// `unauthorized` entries are skipped with a warning.
///
/// The adb command may carry leading arguments, e.g.
/// `adb -H 10.0.0.5 -P 5037`.
#[derive(Debug, Clone)]
pub struct AdbDevices {
    program: String,
    args: Vec<String>,
}

impl AdbDevices {
    /// Creates a source that runs `{adb} devices`.
    pub fn new(adb: &str) -> DeviceResult<Self> {
        let mut words = shell_words::split(adb)
            .map_err(|e| DeviceError::InvalidCommand(adb.to_string(), e.to_string()))?;
        if words.is_empty() {
            return Err(DeviceError::InvalidCommand(
                adb.to_string(),
                "empty command".to_string(),
            ));
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            args: words,
        })
    }
}

#[async_trait]
impl DeviceSource for AdbDevices {
    async fn devices(&self) -> DeviceResult<Vec<String>> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg("devices")
            .output()
            .await
            .map_err(|source| DeviceError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DeviceError::CommandFailed {
                program: self.program.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let devices = parse_adb_devices(&String::from_utf8_lossy(&output.stdout));
        debug!("adb reported {} ready devices", devices.len());
        Ok(devices)
    }

    fn name(&self) -> &'static str {
        "adb"
    }
}

static DEVICE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)\s+(\S+)").expect("static regex"));

/// Parses the output of `adb devices` into ready device serials.
///
/// # Example
///
/// ```
/// use fleetrun::device::parse_adb_devices;
///
/// let out = "List of devices attached\nemulator-5554\tdevice\nR58M\toffline\n\n";
/// assert_eq!(parse_adb_devices(out), vec!["emulator-5554"]);
/// ```
pub fn parse_adb_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*')
        })
        .filter_map(|line| {
            let caps = DEVICE_LINE.captures(line)?;
            let (serial, state) = (&caps[1], &caps[2]);
            if state == "device" {
                Some(serial.to_string())
            } else {
                warn!("Skipping device {} in state '{}'", serial, state);
                None
            }
        })
        .collect()
}
