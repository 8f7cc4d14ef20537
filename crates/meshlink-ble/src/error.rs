//! Error types for the BLE transport

use meshlink_core::{EngineError, MeshError, TransportError};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the BLE transport
#[derive(Error, Debug)]
pub enum BleError {
    #[error("Handshake value has {actual} bytes, expected {expected}")]
    InvalidHandshake { actual: usize, expected: usize },

    #[error("Public key is not valid hex: {0}")]
    InvalidPublicKey(String),

    #[error("Device {device} advertised an invalid PSM")]
    InvalidPsm { device: String },

    #[error("Failed to connect to {device}: {reason}")]
    ConnectionFailed { device: String, reason: String },

    #[error("Mesh service not found on {device}")]
    ServiceNotFound { device: String },

    #[error("Handshake characteristic not found on {device}")]
    CharacteristicNotFound { device: String },

    #[error("Failed to read handshake: {0}")]
    ReadFailed(String),

    #[error("Failed to open L2CAP channel: {0}")]
    ChannelFailed(String),

    #[error("Failed to publish L2CAP channel: {0}")]
    PublishFailed(String),

    #[error("Failed to add GATT service: {0}")]
    ServiceFailed(String),

    #[error("Advertising failed: {0}")]
    AdvertisingFailed(String),

    #[error("Bluetooth is not powered on")]
    NotPoweredOn,

    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("Routing engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BleError> for MeshError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::Engine(e) => MeshError::Engine(e),
            BleError::Io(e) => MeshError::Transport(TransportError::Io(e)),
            BleError::InvalidPsm { device } => {
                MeshError::Transport(TransportError::ProtocolViolation {
                    device,
                    reason: "invalid PSM".into(),
                })
            }
            violation @ BleError::InvalidHandshake { .. } => {
                MeshError::Transport(TransportError::ProtocolViolation {
                    device: String::new(),
                    reason: violation.to_string(),
                })
            }
            other => MeshError::Bluetooth(other.to_string()),
        }
    }
}

impl From<btleplug::Error> for BleError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => BleError::NotPoweredOn,
            other => BleError::ConnectionFailed {
                device: String::new(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(target_os = "linux")]
impl From<bluer::Error> for BleError {
    fn from(err: bluer::Error) -> Self {
        BleError::ChannelFailed(err.to_string())
    }
}

/// Result type for BLE operations
pub type Result<T> = std::result::Result<T, BleError>;
