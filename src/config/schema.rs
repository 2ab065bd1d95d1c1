//! Configuration schema definitions for fleetrun.
//!
//! Every section is optional; a missing `fleetrun.toml` yields
//! [`Config::default`].
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── FleetrunConfig   - Core settings (policy, parallelism, timeouts, output dir)
//! ├── ToolConfig       - The external test tool and how it is invoked
//! ├── DiscoveryConfig  - Test script naming convention
//! ├── DevicesConfig    - Static device list or adb enumeration
//! └── ReportConfig     - Report outputs
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for fleetrun.
///
/// # TOML Structure
///
/// ```toml
/// [fleetrun]
/// output_dir = "runs"
/// policy = "replicate"
/// task_timeout_secs = 1200
///
/// [tool]
/// command = "python -m airtest"
/// lang = "en"
///
/// [devices]
/// serials = ["66J5T19730001281", "YWT0222A10000129"]
/// ```
///
/// # Example
///
/// ```
/// use fleetrun::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [fleetrun]
///     max_parallel = 2
/// "#).unwrap();
/// assert_eq!(config.fleetrun.max_parallel, Some(2));
/// assert_eq!(config.tool.command, "airtest");
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core execution settings.
    #[serde(default)]
    pub fleetrun: FleetrunConfig,

    /// External test tool invocation.
    #[serde(default)]
    pub tool: ToolConfig,

    /// Test script discovery.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Device selection.
    #[serde(default)]
    pub devices: DevicesConfig,

    /// Report outputs.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core fleetrun execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"."` |
/// | `policy` | `balance` |
/// | `max_parallel` | None (one worker per device) |
/// | `task_timeout_secs` | 1800 (30 minutes) |
/// | `report_timeout_secs` | 300 |
/// | `working_dir` | None (current directory) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FleetrunConfig {
    /// Directory holding `{run_id}_data.json`, `{run_id}_logs/` and reports.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// How scripts are spread over devices.
    #[serde(default)]
    pub policy: AssignmentPolicy,

    /// Upper bound on device workers running at the same time.
    ///
    /// Unset means one concurrent worker per device.
    pub max_parallel: Option<usize>,

    /// Hard deadline for one `run` invocation of the tool.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Hard deadline for one `report` invocation of the tool.
    #[serde(default = "default_report_timeout")]
    pub report_timeout_secs: u64,

    /// Working directory for tool invocations.
    pub working_dir: Option<PathBuf>,
}

impl Default for FleetrunConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            policy: AssignmentPolicy::default(),
            max_parallel: None,
            task_timeout_secs: default_task_timeout(),
            report_timeout_secs: default_report_timeout(),
            working_dir: None,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_task_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_report_timeout() -> u64 {
    300
}

/// Policy used to map test scripts onto devices.
///
/// | Policy | Tasks | Behaviour |
/// |--------|-------|-----------|
/// | `balance` | one per script | affinity, then unused devices, then round-robin |
/// | `replicate` | one per script per device | every script on every device |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentPolicy {
    /// Each script runs once, on one device.
    #[default]
    Balance,

    /// Each script runs on every device.
    Replicate,
}

/// Configuration of the external test tool.
///
/// The tool is invoked as
/// `{command} run <script> --device <uri> --log <dir>` and
/// `{command} report <script> --log_root <dir> --outfile <dir>/log.html --lang {lang}`.
///
/// # Example
///
/// ```toml
/// [tool]
/// command = "python -m airtest"
/// device_uri = "Android://127.0.0.1:5037/{device}"
/// lang = "en"
///
/// [tool.env]
/// PYTHONIOENCODING = "utf-8"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolConfig {
    /// Program plus leading arguments, split with shell quoting rules.
    ///
    /// Default: `airtest`
    #[serde(default = "default_tool_command")]
    pub command: String,

    /// Device URI template; `{device}` is replaced with the device id.
    ///
    /// Default: `Android:///{device}`
    #[serde(default = "default_device_uri")]
    pub device_uri: String,

    /// Report language passed to `--lang`.
    ///
    /// Default: `zh`
    #[serde(default = "default_lang")]
    pub lang: String,

    /// Extra environment variables for every tool invocation.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            command: default_tool_command(),
            device_uri: default_device_uri(),
            lang: default_lang(),
            env: HashMap::new(),
        }
    }
}

fn default_tool_command() -> String {
    "airtest".to_string()
}

fn default_device_uri() -> String {
    "Android:///{device}".to_string()
}

fn default_lang() -> String {
    "zh".to_string()
}

/// Test discovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// File name suffix identifying a test script.
    ///
    /// Default: `_test.py`
    #[serde(default = "default_suffix")]
    pub suffix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            suffix: default_suffix(),
        }
    }
}

fn default_suffix() -> String {
    "_test.py".to_string()
}

/// Device selection.
///
/// Devices given on the command line win over `serials`; when both are
/// empty the list comes from `{adb} devices`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DevicesConfig {
    /// Fixed list of device identifiers.
    #[serde(default)]
    pub serials: Vec<String>,

    /// adb executable used for enumeration.
    ///
    /// Default: `adb`
    #[serde(default = "default_adb")]
    pub adb: String,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            serials: Vec::new(),
            adb: default_adb(),
        }
    }
}

fn default_adb() -> String {
    "adb".to_string()
}

/// Report outputs.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `junit` | `true` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Write `{output_dir}/{run_id}_junit.xml` at the end of each run.
    #[serde(default = "default_true")]
    pub junit: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { junit: true }
    }
}

fn default_true() -> bool {
    true
}
