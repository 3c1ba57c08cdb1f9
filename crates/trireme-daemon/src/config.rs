//! Daemon configuration.
//!
//! Loaded from a TOML file; command-line flags override file values.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use trireme_core::secrets::SecretsSpec;

/// Agent configuration file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Identity of this agent, carried in logs.
    pub server_id: String,

    /// Enforcer mode: `local-container`, `remote-container`, or
    /// `local-server`.
    pub mode: String,

    /// Target network CIDRs; empty intercepts everything.
    pub target_networks: Vec<String>,

    /// Signing material. A PSK profile is generated per run when
    /// absent, which only works single-host.
    pub secrets: Option<SecretsSpec>,

    /// Unix socket of the remote-datapath RPC server.
    pub remote_socket: PathBuf,

    /// Require the transmitter side to authorize the receiver.
    pub mutual_auth: bool,

    /// Log every packet decision at debug level.
    pub packet_logs: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_id: "trireme".to_string(),
            mode: "local-server".to_string(),
            target_networks: Vec::new(),
            secrets: None,
            remote_socket: PathBuf::from("/var/run/trireme/remote.sock"),
            mutual_auth: true,
            packet_logs: false,
        }
    }
}

impl AgentConfig {
    /// Loads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert_eq!(config.mode, "local-server");
        assert!(config.mutual_auth);
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut config = AgentConfig::default();
        config.target_networks = vec!["10.0.0.0/8".to_string()];
        config.secrets = Some(SecretsSpec::Psk {
            key_base64: "c2VjcmV0".to_string(),
        });

        let rendered = toml::to_string(&config).unwrap();
        let parsed: AgentConfig = toml::from_str(&rendered).unwrap();

        assert_eq!(parsed.target_networks, config.target_networks);
        assert!(matches!(parsed.secrets, Some(SecretsSpec::Psk { .. })));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let parsed: AgentConfig = toml::from_str("server_id = \"edge-1\"").unwrap();
        assert_eq!(parsed.server_id, "edge-1");
        assert_eq!(parsed.mode, "local-server");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trireme.toml");
        std::fs::write(&path, "mode = \"local-container\"\n").unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.mode, "local-container");

        assert!(AgentConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
