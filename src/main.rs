//! fleetrun CLI - run UI test scripts in parallel across devices.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use fleetrun::config::{self, AssignmentPolicy, Config};
use fleetrun::device::{AdbDevices, DeviceSource, StaticDevices};
use fleetrun::orchestrator::{Orchestrator, RunMode};
use fleetrun::report::{ConsoleReporter, JUnitReporter, MultiReporter, NullReporter};
use fleetrun::state::state_file_dir;
use fleetrun::tool::process::ProcessExecutor;

/// Exit code for configuration, discovery, and state errors.
const EXIT_INFRASTRUCTURE: i32 = 2;

#[derive(Parser)]
#[command(name = "fleetrun")]
#[command(about = "Run UI test scripts in parallel across a device fleet", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path (optional)
    #[arg(short, long, default_value = "fleetrun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test scripts
    Run {
        /// Test script or directory of scripts
        path: PathBuf,

        /// Device to run on (repeatable); defaults to config, then adb
        #[arg(short, long = "device")]
        devices: Vec<String>,

        /// Run every script on every device
        #[arg(long)]
        replicate: bool,

        /// Resume a run by id or state file name, skipping passed tasks
        #[arg(long)]
        resume: Option<String>,

        /// Override maximum concurrently active devices
        #[arg(short, long)]
        parallel: Option<usize>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Show the device assignment without running anything
    Plan {
        /// Test script or directory of scripts
        path: PathBuf,

        /// Device to plan for (repeatable); defaults to config, then adb
        #[arg(short, long = "device")]
        devices: Vec<String>,

        /// Run every script on every device
        #[arg(long)]
        replicate: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List devices ready to run tests
    Devices,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
    }

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            EXIT_INFRASTRUCTURE
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            path,
            devices,
            replicate,
            resume,
            parallel,
            junit,
        } => {
            let options = RunOptions {
                path,
                devices,
                replicate,
                resume,
                parallel,
                junit,
            };
            run_tests(&cli.config, options, cli.verbose).await
        }
        Commands::Plan {
            path,
            devices,
            replicate,
            format,
        } => plan_tests(&cli.config, &path, &devices, replicate, format).await,
        Commands::Devices => list_devices(&cli.config).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

struct RunOptions {
    path: PathBuf,
    devices: Vec<String>,
    replicate: bool,
    resume: Option<String>,
    parallel: Option<usize>,
    junit: Option<PathBuf>,
}

/// `--replicate` wins over the configured policy.
fn policy_for(config: &Config, replicate: bool) -> AssignmentPolicy {
    if replicate {
        AssignmentPolicy::Replicate
    } else {
        config.fleetrun.policy
    }
}

/// Picks the device list: command line, then config, then adb.
async fn resolve_devices(cli_devices: &[String], config: &Config) -> Result<Vec<String>> {
    let source: Box<dyn DeviceSource> = if !cli_devices.is_empty() {
        Box::new(StaticDevices::new(cli_devices.to_vec()))
    } else if !config.devices.serials.is_empty() {
        Box::new(StaticDevices::new(config.devices.serials.clone()))
    } else {
        Box::new(AdbDevices::new(&config.devices.adb)?)
    };

    let devices = source
        .devices()
        .await
        .with_context(|| format!("Failed to list devices ({})", source.name()))?;
    info!("Using {} devices from {}", devices.len(), source.name());
    Ok(devices)
}

async fn run_tests(config_path: &Path, options: RunOptions, verbose: bool) -> Result<i32> {
    let mut config = config::load_config_or_default(config_path)?;
    if let Some(parallel) = options.parallel {
        config.fleetrun.max_parallel = Some(parallel);
    }
    if let Some(dir) = options.resume.as_deref().and_then(state_file_dir) {
        config.fleetrun.output_dir = dir;
    }

    let devices = resolve_devices(&options.devices, &config).await?;
    let policy = policy_for(&config, options.replicate);
    let mode = match options.resume {
        Some(id) => RunMode::Resume(id),
        None => RunMode::Fresh,
    };

    let mut reporter = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));
    if let Some(path) = options.junit {
        reporter = reporter.with_reporter(JUnitReporter::new(path));
    } else if config.report.junit {
        reporter = reporter.with_reporter(JUnitReporter::in_output_dir(
            config.fleetrun.output_dir.clone(),
        ));
    }

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping running tasks");
            trigger.cancel();
        }
    });

    let orchestrator = Orchestrator::new(config, ProcessExecutor::new(), reporter)?
        .with_cancellation_token(token);
    let result = orchestrator
        .run(&options.path, &devices, policy, mode)
        .await?;

    info!("Resume with: fleetrun run {} --resume {}", options.path.display(), result.run_id);
    Ok(result.exit_code())
}

async fn plan_tests(
    config_path: &Path,
    path: &Path,
    devices: &[String],
    replicate: bool,
    format: Format,
) -> Result<i32> {
    let config = config::load_config_or_default(config_path)?;
    let devices = resolve_devices(devices, &config).await?;
    let policy = policy_for(&config, replicate);

    let orchestrator = Orchestrator::new(config, ProcessExecutor::new(), NullReporter)?;
    let assignment = orchestrator.plan(path, &devices, policy)?;

    match format {
        Format::Json => {
            println!("{}", serde_json::to_string_pretty(&assignment)?);
        }
        Format::Text => {
            println!(
                "Planned {} tasks on {} devices:",
                assignment.len(),
                assignment.queues.len()
            );
            for queue in &assignment.queues {
                println!("  {} ({} tasks)", queue.device, queue.len());
                for task in &queue.tasks {
                    println!("    {}  {}", task.log_key, task.unit.path.display());
                }
            }
        }
    }

    Ok(0)
}

async fn list_devices(config_path: &Path) -> Result<i32> {
    let config = config::load_config_or_default(config_path)?;
    let devices = resolve_devices(&[], &config).await?;

    if devices.is_empty() {
        println!("No devices ready");
    }
    for device in &devices {
        println!("{}", device);
    }
    Ok(0)
}

fn validate_config(config_path: &Path) -> Result<i32> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Output dir: {}", config.fleetrun.output_dir.display());
            println!("  Policy: {:?}", config.fleetrun.policy);
            match config.fleetrun.max_parallel {
                Some(n) => println!("  Max parallel: {}", n),
                None => println!("  Max parallel: one per device"),
            }
            println!("  Task timeout: {}s", config.fleetrun.task_timeout_secs);
            println!("  Tool: {}", config.tool.command);
            println!("  Script suffix: {}", config.discovery.suffix);
            if config.devices.serials.is_empty() {
                println!("  Devices: from `{} devices`", config.devices.adb);
            } else {
                println!("  Devices: {}", config.devices.serials.join(", "));
            }
            Ok(0)
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            Ok(1)
        }
    }
}

fn init_config(path: &Path) -> Result<i32> {
    let config = r#"# fleetrun configuration file

[fleetrun]
output_dir = "runs"
policy = "balance"          # or "replicate"
task_timeout_secs = 1800
report_timeout_secs = 300
# max_parallel = 4

[tool]
command = "airtest"
device_uri = "Android:///{device}"
lang = "zh"

[discovery]
suffix = "_test.py"

[devices]
# serials = ["66J5T19730001281", "YWT0222A10000129"]
adb = "adb"

[report]
junit = true
"#;

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        return Ok(1);
    }

    std::fs::write(path, config)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  fleetrun run <path>");

    Ok(0)
}
