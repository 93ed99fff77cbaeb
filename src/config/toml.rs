//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Load the configuration file named on the command line, or defaults
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => Config::default(),
    };
    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    // Party settings
    if let Some(role) = cli.role {
        config.party.role = Some(role);
    }
    if let Some(ref addr) = cli.store_addr {
        config.party.store_addr = Some(addr.clone());
    }
    if cli.demo {
        config.party.demo = true;
    }

    // Store settings
    if let Some(port) = cli.listen_port {
        config.store.listen_port = port;
    }
    if let Some(ref path) = cli.study_file {
        config.store.study_file = Some(path.clone());
    }
    if cli.persist {
        config.store.persist = true;
    }

    // Paths
    if let Some(ref dir) = cli.executables_dir {
        config.paths.executables_dir = dir.clone();
    }
    if let Some(ref file) = cli.data_path_file {
        config.paths.data_path_file = file.clone();
    }

    // Polling; parsed here so a bad value names the flag
    if let Some(ref interval) = cli.poll_interval {
        cli_convert::parse_duration(interval).context("Invalid --poll-interval")?;
        config.polling.interval = interval.clone();
    }
    if let Some(ref timeout) = cli.wait_timeout {
        cli_convert::parse_duration(timeout).context("Invalid --wait-timeout")?;
        config.polling.timeout = Some(timeout.clone());
    }

    if cli.proxy {
        config.proxy.enabled = true;
    }

    // Store address without a port gets the default store port
    if let Some(addr) = config.party.store_addr.take() {
        config.party.store_addr = Some(cli_convert::normalize_addr(&addr, DEFAULT_STORE_PORT));
    }

    Ok(config)
}
