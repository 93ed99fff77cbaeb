//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestrator::ProxySettings;
use crate::sequencer::{Executables, RolePolicy};
use crate::wait::PollPolicy;

/// Default port for the store service
pub const DEFAULT_STORE_PORT: u16 = 9999;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub party: PartyConfig,
    pub store: StoreConfig,
    pub paths: PathsConfig,
    pub executables: Executables,
    pub protocol: ProtocolConfig,
    pub polling: PollingConfig,
    pub proxy: ProxySettings,
}

/// Settings for a party run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartyConfig {
    /// This party's role (0-3)
    pub role: Option<u8>,
    /// Coordination store address
    pub store_addr: Option<String>,
    /// Run from the seeded demo parameter files
    pub demo: bool,
}

/// Settings for the store service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub listen_port: u16,
    /// JSON study document the service is seeded from
    pub study_file: Option<PathBuf>,
    /// Write the document back after every update
    pub persist: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_STORE_PORT,
            study_file: None,
            persist: false,
        }
    }
}

/// Local filesystem layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory the protocol executables run from
    pub executables_dir: PathBuf,
    /// One-line file naming the local data root
    pub data_path_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            executables_dir: PathBuf::from("secure-dti/mpc/code"),
            data_path_file: PathBuf::from("data_path.txt"),
        }
    }
}

/// Protocol-level knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Number of `PORT_P{i}_P{j}` slots per party
    pub port_slots: usize,
    /// Abort a barrier when a peer publishes FAILED
    pub abort_on_peer_failure: bool,
    /// How long a peer may stay FAILED before a barrier aborts ("30s", ...)
    pub peer_failure_grace: String,
    pub roles: RolePolicy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            port_slots: 4,
            abort_on_peer_failure: true,
            peer_failure_grace: "30s".to_string(),
            roles: RolePolicy::default(),
        }
    }
}

impl ProtocolConfig {
    pub fn peer_failure_grace(&self) -> anyhow::Result<Duration> {
        cli_convert::parse_duration(&self.peer_failure_grace)
    }
}

/// Store polling settings; durations use the CLI format ("5s", "500ms", ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval: String,
    /// Upper bound on any single wait; unbounded when absent
    pub timeout: Option<String>,
    /// Per-request timeout against the store service
    pub store_timeout: String,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            timeout: None,
            store_timeout: "30s".to_string(),
        }
    }
}

impl PollingConfig {
    /// Poll policy described by these settings
    pub fn policy(&self) -> anyhow::Result<PollPolicy> {
        let mut policy = PollPolicy::new(cli_convert::parse_duration(&self.interval)?);
        if let Some(timeout) = cli_convert::parse_optional_duration(self.timeout.as_deref())? {
            policy = policy.with_deadline(timeout);
        }
        Ok(policy)
    }

    pub fn store_timeout(&self) -> anyhow::Result<Duration> {
        cli_convert::parse_duration(&self.store_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store.listen_port, 9999);
        assert_eq!(config.protocol.port_slots, 4);
        assert!(config.protocol.abort_on_peer_failure);
        assert_eq!(config.protocol.peer_failure_grace().unwrap(), Duration::from_secs(30));
        assert_eq!(config.protocol.roles.computation_threshold, 3);
        assert_eq!(config.executables.data_sharing, PathBuf::from("bin/ShareData"));
        assert!(!config.proxy.enabled);
    }

    #[test]
    fn test_polling_policy() {
        let polling = PollingConfig {
            interval: "250ms".into(),
            timeout: Some("2m".into()),
            ..Default::default()
        };
        let policy = polling.policy().unwrap();
        assert_eq!(policy.interval, Duration::from_millis(250));
        assert_eq!(policy.deadline, Some(Duration::from_secs(120)));
        assert_eq!(polling.store_timeout().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_polling_policy_without_timeout() {
        let policy = PollingConfig::default().policy().unwrap();
        assert_eq!(policy.interval, Duration::from_secs(5));
        assert_eq!(policy.deadline, None);
    }
}
