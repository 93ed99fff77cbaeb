//! Configuration validation

use super::*;
use crate::config::cli::ExecutionMode;
use crate::study::{Role, StudyState};
use anyhow::{Context, Result};

/// Validate complete configuration for `mode`
pub fn validate_config(config: &Config, mode: ExecutionMode) -> Result<()> {
    match mode {
        ExecutionMode::Party => {
            validate_party(&config.party)?;
            validate_protocol(&config.protocol)?;
            validate_polling(&config.polling)?;
            if config.proxy.enabled {
                validate_proxy(&config.proxy)?;
            }
        }
        ExecutionMode::Store => validate_store(&config.store)?,
        ExecutionMode::Status => {
            if config.party.store_addr.is_none() {
                anyhow::bail!("status mode requires a store address (--store-addr)");
            }
            validate_polling(&config.polling)?;
        }
    }

    Ok(())
}

/// Validate party settings
pub fn validate_party(party: &PartyConfig) -> Result<()> {
    let role = party.role
        .ok_or_else(|| anyhow::anyhow!("party mode requires a role (--role)"))?;
    Role::new(role)?;

    if party.store_addr.as_deref().map_or(true, str::is_empty) {
        anyhow::bail!("party mode requires a store address (--store-addr)");
    }

    Ok(())
}

/// Validate protocol settings
pub fn validate_protocol(protocol: &ProtocolConfig) -> Result<()> {
    if protocol.port_slots < 2 {
        anyhow::bail!("port_slots must be at least 2, got {}", protocol.port_slots);
    }

    if let Some(role) = protocol.roles.data_provider_roles.iter().find(|&&r| r > Role::MAX) {
        anyhow::bail!("data_provider_roles contains invalid role {}", role);
    }

    protocol.peer_failure_grace().context("Invalid peer_failure_grace")?;

    Ok(())
}

/// Validate polling settings
pub fn validate_polling(polling: &PollingConfig) -> Result<()> {
    let policy = polling.policy().context("Invalid polling configuration")?;
    if policy.interval.is_zero() {
        anyhow::bail!("polling interval must be greater than zero");
    }
    if policy.deadline.map_or(false, |d| d < policy.interval) {
        anyhow::bail!(
            "polling timeout ({}) is shorter than the polling interval ({})",
            polling.timeout.as_deref().unwrap_or_default(),
            polling.interval
        );
    }

    let store_timeout = polling.store_timeout().context("Invalid store_timeout")?;
    if store_timeout.is_zero() {
        anyhow::bail!("store_timeout must be greater than zero");
    }

    Ok(())
}

/// Validate proxy settings
pub fn validate_proxy(proxy: &ProxySettings) -> Result<()> {
    if proxy.port == 0 {
        anyhow::bail!("proxy port must be nonzero");
    }
    if proxy.wrapper.trim().is_empty() {
        anyhow::bail!("proxy wrapper must not be empty");
    }
    if !proxy.template.exists() {
        anyhow::bail!("proxy template not found: {}", proxy.template.display());
    }

    Ok(())
}

/// Validate store settings
pub fn validate_store(store: &StoreConfig) -> Result<()> {
    if store.study_file.is_none() {
        anyhow::bail!("store mode requires a study document (--study-file)");
    }
    if store.listen_port == 0 {
        anyhow::bail!("listen_port must be nonzero");
    }

    Ok(())
}

/// Validate configuration against the study it will run in
pub fn validate_against_study(config: &Config, study: &StudyState) -> Result<()> {
    let participants = study.participants.len();
    if config.protocol.port_slots < participants {
        anyhow::bail!(
            "port_slots ({}) is smaller than the number of participants ({})",
            config.protocol.port_slots,
            participants
        );
    }

    if let Some(role) = config.party.role {
        if usize::from(role) >= participants {
            anyhow::bail!(
                "role {} is out of range for a study with {} participants",
                role,
                participants
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn party_config() -> Config {
        let mut config = Config::default();
        config.party.role = Some(1);
        config.party.store_addr = Some("127.0.0.1:9999".into());
        config
    }

    #[test]
    fn test_validate_party() {
        validate_config(&party_config(), ExecutionMode::Party).unwrap();

        let mut config = party_config();
        config.party.role = None;
        assert!(validate_config(&config, ExecutionMode::Party).is_err());

        let mut config = party_config();
        config.party.role = Some(7);
        assert!(validate_config(&config, ExecutionMode::Party).is_err());

        let mut config = party_config();
        config.party.store_addr = None;
        assert!(validate_config(&config, ExecutionMode::Party).is_err());
    }

    #[test]
    fn test_validate_protocol() {
        let mut config = party_config();
        config.protocol.peer_failure_grace = "0s".into();
        validate_config(&config, ExecutionMode::Party).unwrap();

        config.protocol.peer_failure_grace = "soon".into();
        assert!(validate_config(&config, ExecutionMode::Party).is_err());

        let mut config = party_config();
        config.protocol.port_slots = 1;
        assert!(validate_config(&config, ExecutionMode::Party).is_err());
    }

    #[test]
    fn test_validate_polling() {
        let mut config = party_config();
        config.polling.interval = "0s".into();
        assert!(validate_config(&config, ExecutionMode::Party).is_err());

        let mut config = party_config();
        config.polling.interval = "10s".into();
        config.polling.timeout = Some("1s".into());
        assert!(validate_config(&config, ExecutionMode::Party).is_err());

        let mut config = party_config();
        config.polling.store_timeout = "whenever".into();
        assert!(validate_config(&config, ExecutionMode::Party).is_err());
    }

    #[test]
    fn test_validate_proxy() {
        let mut config = party_config();
        config.proxy.enabled = true;
        config.proxy.template = "/nonexistent/proxychains.conf".into();
        assert!(validate_config(&config, ExecutionMode::Party).is_err());

        let template = NamedTempFile::new().unwrap();
        config.proxy.template = template.path().to_path_buf();
        validate_config(&config, ExecutionMode::Party).unwrap();

        config.proxy.port = 0;
        assert!(validate_config(&config, ExecutionMode::Party).is_err());
    }

    #[test]
    fn test_validate_store_and_status() {
        let mut config = Config::default();
        assert!(validate_config(&config, ExecutionMode::Store).is_err());
        config.store.study_file = Some("study.json".into());
        validate_config(&config, ExecutionMode::Store).unwrap();

        assert!(validate_config(&config, ExecutionMode::Status).is_err());
        config.party.store_addr = Some("store:9999".into());
        validate_config(&config, ExecutionMode::Status).unwrap();
    }

    #[test]
    fn test_validate_against_study() {
        let study = StudyState::new("s", vec!["a".into(), "b".into(), "c".into()]);
        let mut config = party_config();
        validate_against_study(&config, &study).unwrap();

        config.protocol.port_slots = 2;
        assert!(validate_against_study(&config, &study).is_err());

        config.protocol.port_slots = 4;
        config.party.role = Some(3);
        assert!(validate_against_study(&config, &study).is_err());
    }
}
