pub mod config;
pub mod doctor;

use clap::{Parser, Subcommand};

/// uds-engine — the UDS virtual-desktop broker.
#[derive(Debug, Parser)]
#[command(name = "uds-engine", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the engine: scheduler loop, cache updater, deferred
    /// deletion worker (default when no subcommand is given).
    Run,
    /// Run diagnostic checks against the current configuration.
    Doctor,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

/// Loads the configuration from the path named by `UDS_CONFIG` (or
/// `config.toml` by default), falling back to all-defaults if the file
/// does not exist. Shared by `run`, `doctor`, and `config` so the
/// loading logic lives in one place.
pub fn load_config() -> anyhow::Result<(uds_domain::config::EngineConfig, String)> {
    let config_path = std::env::var("UDS_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        uds_domain::config::EngineConfig::default()
    };

    Ok((config.clamped(), config_path))
}
