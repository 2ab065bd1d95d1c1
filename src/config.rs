//! Configuration loading and schema definitions for fleetrun.
//!
//! Configuration is read from a TOML file (`fleetrun.toml` by default).
//! Every setting has a default, so the file itself is optional.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Loads fleetrun configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use fleetrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("fleetrun.toml"))?;
/// println!("Tool: {}", config.tool.command);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = load_config_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from `path` if it exists, otherwise returns defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

/// Loads fleetrun configuration from a TOML string.
///
/// Configured paths are expanded (`~` and `$VAR`) after parsing.
///
/// # Example
///
/// ```
/// use fleetrun::config::{load_config_str, AssignmentPolicy};
///
/// let config = load_config_str(r#"
///     [fleetrun]
///     policy = "replicate"
///
///     [devices]
///     serials = ["emulator-5554"]
/// "#)?;
///
/// assert_eq!(config.fleetrun.policy, AssignmentPolicy::Replicate);
/// assert_eq!(config.devices.serials, vec!["emulator-5554"]);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;

    config.fleetrun.output_dir = expand_path(&config.fleetrun.output_dir)?;
    if let Some(dir) = &config.fleetrun.working_dir {
        config.fleetrun.working_dir = Some(expand_path(dir)?);
    }

    Ok(config)
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
