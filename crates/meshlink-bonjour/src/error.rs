//! Error types for the local-network transport

use meshlink_core::{EngineError, MeshError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BonjourError {
    #[error("mDNS daemon error: {0}")]
    Daemon(String),

    #[error("Failed to register service {instance}: {reason}")]
    RegistrationFailed { instance: String, reason: String },

    #[error("Failed to browse {service_type}: {reason}")]
    BrowseFailed {
        service_type: String,
        reason: String,
    },

    #[error("No address reachable for {endpoint}")]
    Unreachable { endpoint: String },

    #[error("Bonjour session is not running")]
    SessionClosed,

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<mdns_sd::Error> for BonjourError {
    fn from(err: mdns_sd::Error) -> Self {
        BonjourError::Daemon(err.to_string())
    }
}

impl From<BonjourError> for MeshError {
    fn from(err: BonjourError) -> Self {
        match err {
            BonjourError::Engine(e) => MeshError::Engine(e),
            other => MeshError::Network(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BonjourError>;
