//! Bluetooth LE L2CAP transport for the meshlink peer bridge
//!
//! Nodes advertise a mesh service whose single readable characteristic holds
//! a 10-byte handshake: the L2CAP PSM they listen on and the first bytes of
//! their routing public key. Scanning nodes read it, and the node with the
//! lower key opens the channel, so each pair ends up with exactly one link.
//!
//! - [`protocol`] - service identifiers, handshake codec and the initiator rule
//! - [`platform`] - the OS Bluetooth surface both roles are written against
//! - [`state`] - per-device connection tracking with timeouts
//! - [`peer`] - one L2CAP channel bridged to one routing-engine conduit
//! - [`client`] - the central role
//! - [`server`] - the peripheral role
//! - [`backend`] - btleplug and BlueZ implementations of [`platform`]
//!
//! Enable the `testing` feature for a channel-driven fake stack.

pub mod backend;
pub mod client;
pub mod error;
pub mod peer;
pub mod platform;
pub mod protocol;
pub mod server;
pub mod state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::CentralRole;
pub use error::{BleError, Result};
pub use peer::{BlePeer, BLE_ZONE};
pub use platform::{
    BleCentral, BleChannel, BlePeripheralManager, BlePlatform, CentralEvent, ChannelStream,
    PeripheralEvent, PeripheralLink, PeripheralRef, RadioState, UnsupportedPeripheral,
};
pub use protocol::{
    tie_break, Handshake, TieBreak, HANDSHAKE_CHARACTERISTIC_UUID, HANDSHAKE_LEN, KEY_SLOT_LEN,
    MESH_SERVICE_UUID,
};
pub use server::PeripheralRole;
pub use state::{BleState, DevicePhase};
