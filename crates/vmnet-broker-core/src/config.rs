//! Centralized configuration for the broker.
//!
//! Compile-time limits live on [`BrokerLimits`]. Runtime settings (service
//! socket, network catalog, timeouts) are loaded into [`BrokerConfig`], either
//! from a JSON file or from the built-in defaults.

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Protocol and resource limits.
pub struct BrokerLimits;

impl BrokerLimits {
    pub const SOCKET_FILENAME: &'static str = "vmnet-broker.sock";
    pub const SOCKET_ENV_VAR: &'static str = "VMNET_BROKER_SOCKET";
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;
    pub const MAX_SESSIONS: usize = 256;
    pub const MAX_NETWORK_NAME_LEN: usize = 64;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_CREATE_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
}

/// How a network is attached to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// NAT to the host's external interface.
    Shared,
    /// Host-only, no external connectivity.
    Host,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Shared => "shared",
            NetworkMode::Host => "host",
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network the broker is willing to vend.
///
/// When `subnet` and `mask` are both absent the backend picks a free subnet,
/// which avoids clashing with networks allocated by other programs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub mode: NetworkMode,
    #[serde(default)]
    pub subnet: Option<Ipv4Addr>,
    #[serde(default)]
    pub mask: Option<Ipv4Addr>,
}

impl NetworkConfig {
    pub fn new(name: impl Into<String>, mode: NetworkMode) -> Self {
        Self {
            name: name.into(),
            mode,
            subnet: None,
            mask: None,
        }
    }

    pub fn with_subnet(mut self, subnet: Ipv4Addr, mask: Ipv4Addr) -> Self {
        self.subnet = Some(subnet);
        self.mask = Some(mask);
        self
    }

    /// Networks available when no configuration file is given.
    pub fn builtin() -> Vec<NetworkConfig> {
        vec![
            NetworkConfig::new("shared", NetworkMode::Shared),
            NetworkConfig::new("host", NetworkMode::Host),
        ]
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BrokerError::Config {
                message: "network name must not be empty".to_string(),
            });
        }
        if self.name.len() > BrokerLimits::MAX_NETWORK_NAME_LEN {
            return Err(BrokerError::Config {
                message: format!(
                    "network name '{}' exceeds {} bytes",
                    self.name,
                    BrokerLimits::MAX_NETWORK_NAME_LEN
                ),
            });
        }
        if self.subnet.is_some() != self.mask.is_some() {
            return Err(BrokerError::Config {
                message: format!(
                    "network '{}': subnet and mask must be set together",
                    self.name
                ),
            });
        }
        Ok(())
    }
}

fn default_idle_timeout_secs() -> Option<u64> {
    Some(BrokerLimits::DEFAULT_IDLE_TIMEOUT_SECS)
}

fn default_create_timeout_secs() -> u64 {
    BrokerLimits::DEFAULT_CREATE_TIMEOUT_SECS
}

/// Runtime configuration for a broker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Path of the service socket. Only one broker may own it at a time.
    #[serde(default = "BrokerConfig::default_socket_path")]
    pub socket_path: PathBuf,

    #[serde(default = "NetworkConfig::builtin")]
    pub networks: Vec<NetworkConfig>,

    /// Seconds to stay alive after the last client disconnects; `null` keeps
    /// the broker running forever.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: Option<u64>,

    #[serde(default = "default_create_timeout_secs")]
    pub create_timeout_secs: u64,

    /// If set, only these user ids may acquire networks.
    #[serde(default)]
    pub allowed_uids: Option<Vec<u32>>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: Self::default_socket_path(),
            networks: NetworkConfig::builtin(),
            idle_timeout_secs: default_idle_timeout_secs(),
            create_timeout_secs: default_create_timeout_secs(),
            allowed_uids: None,
        }
    }
}

impl BrokerConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| BrokerError::io_with_path(e, path))?;
        let config: BrokerConfig =
            serde_json::from_str(&content).map_err(|e| BrokerError::Config {
                message: format!("failed to parse {}: {}", path.display(), e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Well-known service socket location.
    ///
    /// `$VMNET_BROKER_SOCKET` wins, then the per-user runtime directory, then
    /// the system temp directory.
    pub fn default_socket_path() -> PathBuf {
        if let Some(path) = std::env::var_os(BrokerLimits::SOCKET_ENV_VAR) {
            return PathBuf::from(path);
        }
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(BrokerLimits::SOCKET_FILENAME)
    }

    pub fn validate(&self) -> Result<()> {
        if self.networks.is_empty() {
            return Err(BrokerError::Config {
                message: "no networks configured".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for network in &self.networks {
            network.validate()?;
            if !seen.insert(network.name.as_str()) {
                return Err(BrokerError::Config {
                    message: format!("duplicate network name '{}'", network.name),
                });
            }
        }

        if self.create_timeout_secs == 0 {
            return Err(BrokerError::Config {
                message: "create_timeout_secs must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.name == name)
    }
}
