//! Platform BLE surface consumed by the central and peripheral roles
//!
//! The OS stack delivers results asynchronously, so commands on these traits
//! either return quickly or are fire-and-forget: their outcome arrives later as
//! a [`CentralEvent`] or [`PeripheralEvent`] on the role's event channel. Each
//! role drains its channel on its own task, which keeps central and peripheral
//! transitions from interleaving.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use meshlink_core::DeviceUuid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{BleError, Result};

// ----------------------------------------------------------------------------
// Radio and Channel Types
// ----------------------------------------------------------------------------

/// Power state reported by a central or peripheral manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_powered_on(&self) -> bool {
        matches!(self, RadioState::PoweredOn)
    }
}

/// Byte stream of an open L2CAP channel
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ChannelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An open L2CAP channel and the device at the other end
pub struct BleChannel {
    pub device: DeviceUuid,
    pub stream: Box<dyn ChannelStream>,
}

impl BleChannel {
    pub fn new(device: DeviceUuid, stream: impl ChannelStream + 'static) -> Self {
        Self {
            device,
            stream: Box::new(stream),
        }
    }
}

impl fmt::Debug for BleChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleChannel")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Central Role
// ----------------------------------------------------------------------------

/// A remote peripheral discovered by the central role
pub trait PeripheralLink: Send + Sync + fmt::Debug {
    fn device(&self) -> DeviceUuid;

    /// Begin connecting; answers with `Connected` or `FailedToConnect`
    fn connect(&self);

    /// Look up the mesh service and handshake characteristic; answers with
    /// `HandshakeDiscovered`
    fn discover_handshake(&self);

    /// Read the handshake value; answers with `HandshakeRead`
    fn read_handshake(&self);

    /// Open an L2CAP channel to `psm`; answers with `ChannelOpened`
    fn open_channel(&self, psm: u16);

    /// Drop the OS-level connection. Fails when the radio is not powered on.
    fn cancel_connection(&self) -> Result<()>;
}

pub type PeripheralRef = Arc<dyn PeripheralLink>;

#[async_trait]
pub trait BleCentral: Send + Sync {
    fn radio_state(&self) -> RadioState;
    fn is_scanning(&self) -> bool;
    async fn start_scan(&self, service: Uuid) -> Result<()>;
    async fn stop_scan(&self) -> Result<()>;
}

#[derive(Debug)]
pub enum CentralEvent {
    StateChanged(RadioState),
    Discovered(PeripheralRef),
    Connected(DeviceUuid),
    FailedToConnect {
        device: DeviceUuid,
        reason: String,
    },
    Disconnected(DeviceUuid),
    HandshakeDiscovered {
        device: DeviceUuid,
        result: Result<()>,
    },
    HandshakeRead {
        device: DeviceUuid,
        result: Result<Vec<u8>>,
    },
    ChannelOpened {
        device: DeviceUuid,
        result: Result<BleChannel>,
    },
}

// ----------------------------------------------------------------------------
// Peripheral Role
// ----------------------------------------------------------------------------

#[async_trait]
pub trait BlePeripheralManager: Send + Sync {
    fn radio_state(&self) -> RadioState;

    /// Publish an unencrypted L2CAP channel; answers with `ChannelPublished`
    fn publish_channel(&self);

    /// Replace any published services with the mesh service carrying
    /// `handshake` as its readable value; answers with `ServiceAdded`
    fn set_service(&self, handshake: Vec<u8>);

    async fn start_advertising(&self) -> Result<()>;
    async fn stop_advertising(&self) -> Result<()>;
    async fn remove_all_services(&self) -> Result<()>;
}

#[derive(Debug)]
pub enum PeripheralEvent {
    StateChanged(RadioState),
    ChannelPublished(Result<u16>),
    ServiceAdded(Result<()>),
    InboundChannel {
        device: DeviceUuid,
        result: Result<BleChannel>,
    },
}

// ----------------------------------------------------------------------------
// Platform Bundle
// ----------------------------------------------------------------------------

/// Both roles of a platform backend together with their event channels
pub struct BlePlatform {
    pub central: Arc<dyn BleCentral>,
    pub central_events: mpsc::UnboundedReceiver<CentralEvent>,
    pub peripheral: Arc<dyn BlePeripheralManager>,
    pub peripheral_events: mpsc::UnboundedReceiver<PeripheralEvent>,
}

impl fmt::Debug for BlePlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlePlatform")
            .field("central", &self.central.radio_state())
            .field("peripheral", &self.peripheral.radio_state())
            .finish()
    }
}

/// Peripheral manager for platforms without peripheral-role support
#[derive(Debug, Default)]
pub struct UnsupportedPeripheral;

#[async_trait]
impl BlePeripheralManager for UnsupportedPeripheral {
    fn radio_state(&self) -> RadioState {
        RadioState::Unsupported
    }

    fn publish_channel(&self) {}

    fn set_service(&self, _handshake: Vec<u8>) {}

    async fn start_advertising(&self) -> Result<()> {
        Err(BleError::Unsupported("advertising"))
    }

    async fn stop_advertising(&self) -> Result<()> {
        Ok(())
    }

    async fn remove_all_services(&self) -> Result<()> {
        Ok(())
    }
}
