//! Node configuration management
//!
//! Configuration is layered with figment, later layers winning:
//! - built-in defaults
//! - `meshlink.toml` in the working directory
//! - the file named by `--config`
//! - `MESHLINK_*` environment variables, nested with `__`
//!   (`MESHLINK_SETTINGS__RELAYING_ENABLED=true`)
//! - command line flags

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use meshlink_core::{EnginePaths, MeshConfig, MeshSettings, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "meshlink.toml";
pub const ENV_PREFIX: &str = "MESHLINK_";

// ----------------------------------------------------------------------------
// Node Configuration
// ----------------------------------------------------------------------------

/// Everything the `meshlink` binary needs to run a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Transport tunables
    pub mesh: MeshConfig,
    /// Toggles applied each time the service starts
    pub settings: MeshSettings,
    pub node: NodeOptions,
}

/// Process-level options outside the mesh service itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// Hex public key for the in-process engine; random when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub status_interval_secs: u64,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            storage_dir: None,
            cache_dir: None,
            public_key: None,
            status_interval_secs: 30,
        }
    }
}

impl NodeOptions {
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

// ----------------------------------------------------------------------------
// Command Line Overrides
// ----------------------------------------------------------------------------

/// Values given on the command line; `None` leaves lower layers untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub storage_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub bluetooth_disabled: Option<bool>,
    pub bonjour_disabled: Option<bool>,
    pub multicast_disabled: Option<bool>,
    pub relaying_enabled: Option<bool>,
    /// Also turns the static peer on
    pub static_peer: Option<String>,
    pub listen_addr: Option<SocketAddr>,
    pub public_key: Option<String>,
    pub status_interval_secs: Option<u64>,
}

impl ConfigOverrides {
    fn apply(&self, mut figment: Figment) -> Figment {
        if let Some(dir) = &self.storage_dir {
            figment = figment.merge(("node.storage_dir", dir));
        }
        if let Some(dir) = &self.cache_dir {
            figment = figment.merge(("node.cache_dir", dir));
        }
        if let Some(key) = &self.public_key {
            figment = figment.merge(("node.public_key", key));
        }
        if let Some(secs) = self.status_interval_secs {
            figment = figment.merge(("node.status_interval_secs", secs));
        }
        if let Some(disabled) = self.bluetooth_disabled {
            figment = figment.merge(("settings.bluetooth_disabled", disabled));
        }
        if let Some(disabled) = self.bonjour_disabled {
            figment = figment.merge(("settings.bonjour_disabled", disabled));
        }
        if let Some(disabled) = self.multicast_disabled {
            figment = figment.merge(("settings.multicast_disabled", disabled));
        }
        if let Some(enabled) = self.relaying_enabled {
            figment = figment.merge(("settings.relaying_enabled", enabled));
        }
        if let Some(uri) = &self.static_peer {
            figment = figment
                .merge(("settings.static_peer_enabled", true))
                .merge(("settings.static_peer_uri", uri));
        }
        if let Some(addr) = self.listen_addr {
            figment = figment.merge(("mesh.bonjour.listen_addr", addr.to_string()));
        }
        figment
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl NodeConfig {
    /// The full provider stack, without extraction or validation
    pub fn figment(config_file: Option<&Path>, overrides: &ConfigOverrides) -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(DEFAULT_CONFIG_FILE));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        overrides.apply(figment)
    }

    /// Load and validate; an explicit `config_file` must exist
    pub fn load(config_file: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        if let Some(path) = config_file {
            if !path.is_file() {
                return Err(CliError::Config(format!(
                    "configuration file {} not found",
                    path.display()
                )));
            }
        }

        let config: NodeConfig = Self::figment(config_file, overrides).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.mesh.validate()?;

        if let Some(key) = &self.node.public_key {
            let bytes = PublicKey::new(key.as_str())
                .to_bytes()
                .map_err(|e| CliError::Config(format!("invalid public key {}: {}", key, e)))?;
            if bytes.len() < 8 {
                return Err(CliError::Config(format!(
                    "public key {} is shorter than 8 bytes",
                    key
                )));
            }
        }

        if self.node.status_interval_secs == 0 {
            return Err(CliError::Config(
                "status_interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Storage and cache directories, under the temp dir unless configured
    pub fn paths(&self) -> EnginePaths {
        let base = std::env::temp_dir().join("meshlink");
        EnginePaths::new(
            self.node
                .storage_dir
                .clone()
                .unwrap_or_else(|| base.join("storage")),
            self.node
                .cache_dir
                .clone()
                .unwrap_or_else(|| base.join("cache")),
        )
    }

    /// Example configuration file content
    pub fn example_config() -> Result<String> {
        let example = NodeConfig {
            settings: MeshSettings {
                static_peer_enabled: false,
                static_peer_uri: "tcp://192.168.1.10:65432".to_string(),
                relaying_enabled: true,
                ..Default::default()
            },
            node: NodeOptions {
                storage_dir: Some(PathBuf::from("/var/lib/meshlink")),
                cache_dir: Some(PathBuf::from("/var/cache/meshlink")),
                ..Default::default()
            },
            ..Default::default()
        };
        Ok(toml::to_string_pretty(&example)?)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
