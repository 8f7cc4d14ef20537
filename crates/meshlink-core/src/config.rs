//! Tunables and persisted user settings

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::MAX_FRAME_SIZE;
use crate::errors::MeshError;

// ----------------------------------------------------------------------------
// Transport Configuration
// ----------------------------------------------------------------------------

/// Configuration for the Bluetooth LE roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// How long a discovered device may take to connect and hand over its PSM
    pub connect_timeout: Duration,
    /// How long an outbound L2CAP channel may take to open
    pub channel_timeout: Duration,
    /// Minimum gap between two connection attempts to the same device
    pub rediscovery_interval: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            channel_timeout: Duration::from_secs(10),
            rediscovery_interval: Duration::from_secs(2),
        }
    }
}

impl BleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_channel_timeout(mut self, timeout: Duration) -> Self {
        self.channel_timeout = timeout;
        self
    }

    pub fn with_rediscovery_interval(mut self, interval: Duration) -> Self {
        self.rediscovery_interval = interval;
        self
    }
}

/// Configuration for the local-network transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BonjourConfig {
    /// Fully qualified DNS-SD service type
    pub service_type: String,
    /// Address the listener binds; port 0 picks a free port
    pub listen_addr: SocketAddr,
    /// TXT record key carrying the node's public key
    pub txt_key: String,
}

impl Default for BonjourConfig {
    fn default() -> Self {
        Self {
            service_type: "_pinecone._tcp.local.".to_string(),
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            txt_key: "key".to_string(),
        }
    }
}

impl BonjourConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_txt_key(mut self, key: impl Into<String>) -> Self {
        self.txt_key = key.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on read buffer size; clamped to the engine's own maximum
    pub max_frame_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

// ----------------------------------------------------------------------------
// Top-level Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub ble: BleConfig,
    pub bonjour: BonjourConfig,
    pub engine: EngineConfig,
}

impl MeshConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ble(mut self, ble: BleConfig) -> Self {
        self.ble = ble;
        self
    }

    pub fn with_bonjour(mut self, bonjour: BonjourConfig) -> Self {
        self.bonjour = bonjour;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.engine.max_frame_size = size;
        self
    }

    /// Reject values that would make the transports unusable
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.ble.connect_timeout.is_zero() || self.ble.channel_timeout.is_zero() {
            return Err(MeshError::Configuration(
                "BLE timeouts must be greater than zero".into(),
            ));
        }
        if self.engine.max_frame_size == 0 {
            return Err(MeshError::Configuration(
                "max_frame_size must be greater than zero".into(),
            ));
        }
        if !self.bonjour.service_type.starts_with('_') {
            return Err(MeshError::Configuration(format!(
                "service type {} must start with an underscore",
                self.bonjour.service_type
            )));
        }
        if self.bonjour.txt_key.is_empty() {
            return Err(MeshError::Configuration("txt_key must not be empty".into()));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Persisted Settings
// ----------------------------------------------------------------------------

/// User toggles applied every time the service starts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    pub static_peer_enabled: bool,
    pub static_peer_uri: String,
    pub relaying_enabled: bool,
    pub bluetooth_disabled: bool,
    pub multicast_disabled: bool,
    pub bonjour_disabled: bool,
    pub self_relay_servers: String,
}

impl MeshSettings {
    /// The URI to hand to the engine, or an empty string when disabled
    pub fn effective_static_peer(&self) -> &str {
        if self.static_peer_enabled {
            self.static_peer_uri.trim()
        } else {
            ""
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.ble.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.ble.channel_timeout, Duration::from_secs(10));
        assert_eq!(config.ble.rediscovery_interval, Duration::from_secs(2));
        assert_eq!(config.bonjour.service_type, "_pinecone._tcp.local.");
        assert_eq!(config.bonjour.txt_key, "key");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let config = MeshConfig::new()
            .with_ble(BleConfig::new().with_channel_timeout(Duration::ZERO));
        assert!(matches!(config.validate(), Err(MeshError::Configuration(_))));

        let config = MeshConfig::new().with_max_frame_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_settings_deserialize() {
        let settings: MeshSettings =
            serde_json::from_str(r#"{"relaying_enabled": true, "static_peer_uri": " tcp://a:1 "}"#)
                .unwrap();
        assert!(settings.relaying_enabled);
        assert!(!settings.bluetooth_disabled);
        assert_eq!(settings.effective_static_peer(), "");

        let enabled = MeshSettings {
            static_peer_enabled: true,
            ..settings
        };
        assert_eq!(enabled.effective_static_peer(), "tcp://a:1");
    }
}
