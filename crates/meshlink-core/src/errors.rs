//! Error types for the meshlink workspace
//!
//! Transport crates define their own error enums and fold them into
//! [`MeshError`] so the service layer deals with a single type.

use thiserror::Error;

use crate::types::PeerType;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors reported by the routing engine or one of its conduits
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Routing engine is not running")]
    NotRunning,

    #[error("Routing engine is already running")]
    AlreadyRunning,

    #[error("Failed to allocate {peer_type} conduit in zone {zone}: {reason}")]
    ConduitCreationFailed {
        zone: String,
        peer_type: PeerType,
        reason: String,
    },

    #[error("Conduit closed")]
    ConduitClosed,

    #[error("Conduit I/O failed: {0}")]
    ConduitIo(String),

    #[error("Engine failure: {0}")]
    Internal(String),
}

/// Errors raised while moving bytes between a transport and a conduit
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport is not available: {transport_type}")]
    Unavailable { transport_type: String },

    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Protocol violation from {device}: {reason}")]
    ProtocolViolation { device: String, reason: String },

    #[error("Transport closed")]
    Closed,
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Unified error for the mesh bridge
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    #[error("Local network error: {0}")]
    Network(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Transport(TransportError::Io(err))
    }
}

impl From<tokio::task::JoinError> for MeshError {
    fn from(err: tokio::task::JoinError) -> Self {
        MeshError::Task(err.to_string())
    }
}

/// Result type for meshlink operations
pub type Result<T> = std::result::Result<T, MeshError>;
