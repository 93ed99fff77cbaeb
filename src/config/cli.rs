//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Party mode (default) - run this party through every protocol phase
    Party,
    /// Store mode - host the shared study document for all parties
    Store,
    /// Status mode - print the study status table and exit
    Status,
}

/// phasesync - multi-party phase synchronization and orchestration
#[derive(Parser, Debug, Clone)]
#[command(name = "phasesync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode: party, store, or status
    #[arg(long, value_enum, default_value = "party")]
    pub mode: ExecutionMode,

    /// TOML configuration file (CLI options override its values)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    // === Party Options ===
    /// This party's role (0-3)
    #[arg(short = 'r', long)]
    pub role: Option<u8>,

    /// Address of the coordination store (e.g., "10.0.1.10:9999")
    #[arg(long, env = "PHASESYNC_STORE")]
    pub store_addr: Option<String>,

    /// Use the seeded demo parameter files and skip parameter resolution
    #[arg(long)]
    pub demo: bool,

    /// Route executable traffic through the local SOCKS proxy helper
    #[arg(long)]
    pub proxy: bool,

    /// Directory the protocol executables run from
    #[arg(long)]
    pub executables_dir: Option<PathBuf>,

    /// File whose first line is the local data root
    #[arg(long)]
    pub data_path_file: Option<PathBuf>,

    /// Store polling interval (e.g., 5s, 500ms)
    #[arg(long)]
    pub poll_interval: Option<String>,

    /// Give up waiting on peers after this long (e.g., 30m, 2h)
    #[arg(long)]
    pub wait_timeout: Option<String>,

    // === Store Options ===
    /// Port for the store to listen on (store mode only)
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// JSON study document to seed the store with (store mode only)
    #[arg(long)]
    pub study_file: Option<PathBuf>,

    /// Write the study document back to the study file after every update
    #[arg(long)]
    pub persist: bool,

    // === Runtime Options ===
    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Validate configuration, resolve parameters and print the planned commands without running them
    #[arg(long)]
    pub dry_run: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    ///
    /// Only checks that can be made without the configuration file; the
    /// merged configuration goes through `validator::validate_config`.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(role) = self.role {
            if role > crate::study::Role::MAX {
                anyhow::bail!("role must be between 0 and {}, got {}", crate::study::Role::MAX, role);
            }
        }

        if self.mode != ExecutionMode::Store {
            if self.persist {
                anyhow::bail!("--persist is only valid in store mode");
            }
            if self.study_file.is_some() {
                anyhow::bail!("--study-file is only valid in store mode");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_party_args() {
        let cli = Cli::try_parse_from([
            "phasesync",
            "--role",
            "1",
            "--store-addr",
            "10.0.0.5:9999",
            "--proxy",
            "--poll-interval",
            "500ms",
        ])
        .unwrap();

        assert_eq!(cli.mode, ExecutionMode::Party);
        assert_eq!(cli.role, Some(1));
        assert_eq!(cli.store_addr.as_deref(), Some("10.0.0.5:9999"));
        assert!(cli.proxy);
        assert_eq!(cli.poll_interval.as_deref(), Some("500ms"));
        cli.validate().unwrap();
    }

    #[test]
    fn test_parse_store_args() {
        let cli = Cli::try_parse_from([
            "phasesync",
            "--mode",
            "store",
            "--listen-port",
            "7000",
            "--study-file",
            "study.json",
            "--persist",
        ])
        .unwrap();

        assert_eq!(cli.mode, ExecutionMode::Store);
        assert_eq!(cli.listen_port, Some(7000));
        cli.validate().unwrap();
    }

    #[test]
    fn test_validate_role_range() {
        let cli = Cli::try_parse_from(["phasesync", "--role", "4"]).unwrap();
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_store_only_flags() {
        let cli = Cli::try_parse_from(["phasesync", "--persist"]).unwrap();
        assert!(cli.validate().is_err());
    }
}
