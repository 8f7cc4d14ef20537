//! Mesh service facade
//!
//! [`MeshService`] owns the routing engine for as long as the node is running
//! and switches the Bluetooth and local-network transports on and off. Every
//! toggle is safe to call at any time and does nothing while the engine is
//! stopped.

mod ble_session;
pub mod builder;
pub mod service;

pub use ble_session::BleSession;
pub use builder::MeshServiceBuilder;
pub use service::{MeshService, ServiceState};
