//! Agent configuration.
//!
//! Loaded from a TOML file when one is present; every field has a default
//! so a missing or partial file still yields a working configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::runner::DEFAULT_SOCKET_PATH;

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Coordination socket path inside the shared workspace volume.
    pub socket_path: PathBuf,

    /// Shared working directory mounted into all containers.
    pub checkout_path: String,

    /// Image carrying the agent binary, used for the checkout container and
    /// the default command container.
    pub agent_image: String,

    /// Payload of the checkout container.
    pub checkout_command: Vec<String>,

    /// Seconds between job leases when the queue is empty.
    pub ping_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            checkout_path: "/workspace".to_string(),
            agent_image: "buildkite/agent:latest".to_string(),
            checkout_command: vec![
                "buildkite-agent".to_string(),
                "bootstrap".to_string(),
                "--phases=checkout".to_string(),
            ],
            ping_interval_secs: 5,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file is missing or malformed.
    pub fn load_from_path(path: &Path) -> Self {
        if !path.exists() {
            debug!("config file {path:?} not found, using defaults");
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!("failed to parse config {path:?}: {e}, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!("failed to read config {path:?}: {e}, using defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.checkout_path, "/workspace");
        assert_eq!(config.ping_interval_secs, 5);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            agent_image = "example.com/agent:v2"
            "#,
        )
        .unwrap();
        assert_eq!(config.agent_image, "example.com/agent:v2");
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AgentConfig::load_from_path(Path::new("/no/such/config.toml"));
        assert_eq!(config.checkout_path, "/workspace");
    }
}
