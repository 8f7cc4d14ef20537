//! A routing-engine peer carried over one L2CAP channel
//!
//! `BlePeer` owns the channel and one conduit. A reader task copies channel
//! bytes into the conduit and a writer task copies conduit frames onto the
//! channel; both blocking conduit calls run on the blocking pool. End of
//! stream, stream errors and conduit failures all close the peer.

use std::sync::Arc;

use meshlink_core::link::{pump_inbound, pump_outbound, EofPolicy, LinkCore};
use meshlink_core::{DeviceUuid, LinkId, PeerTransport, PeerType, RoutingEngine, StopHook};
use tracing::info;

use crate::error::Result;
use crate::platform::BleChannel;
use crate::state::BleState;

/// Conduit zone for every BLE peer
pub const BLE_ZONE: &str = "ble";

#[derive(Debug)]
pub struct BlePeer {
    device: DeviceUuid,
    core: Arc<LinkCore>,
}

impl BlePeer {
    /// Allocate a conduit and start pumping `channel`.
    ///
    /// Fails without touching the channel when the engine refuses a conduit.
    pub fn open(
        engine: &dyn RoutingEngine,
        channel: BleChannel,
        max_frame_size: usize,
        when_stopped: StopHook,
    ) -> Result<Arc<Self>> {
        let core = Arc::new(LinkCore::new(
            engine,
            BLE_ZONE,
            PeerType::Bluetooth,
            when_stopped,
        )?);
        let BleChannel { device, stream } = channel;
        info!("Opening BLE peering with {} ({})", device, core.id());

        let (reader, writer) = tokio::io::split(stream);
        core.mark_open();
        tokio::spawn(pump_inbound(
            core.clone(),
            reader,
            max_frame_size,
            EofPolicy::Close,
        ));
        tokio::spawn(pump_outbound(core.clone(), writer));

        Ok(Arc::new(Self { device, core }))
    }

    /// Open a peer for `channel` and hand it to the tracker. The peer's stop
    /// hook cleans the device up again.
    pub fn attach(
        state: &BleState,
        engine: &dyn RoutingEngine,
        channel: BleChannel,
        max_frame_size: usize,
    ) -> Result<Arc<Self>> {
        let device = channel.device.clone();
        let tracker = state.clone();
        let stopped_device = device.clone();
        let peer = Self::open(
            engine,
            channel,
            max_frame_size,
            Box::new(move |link| tracker.peer_stopped(&stopped_device, link)),
        )?;

        state.add_peer(&device, peer.clone());
        if !peer.is_open() {
            // closed before the tracker knew about it
            state.clear_all_device_state(&device);
        }
        Ok(peer)
    }

    pub fn device(&self) -> &DeviceUuid {
        &self.device
    }
}

impl PeerTransport for BlePeer {
    fn link_id(&self) -> LinkId {
        self.core.id()
    }

    fn peer_type(&self) -> PeerType {
        PeerType::Bluetooth
    }

    fn zone(&self) -> &str {
        self.core.zone()
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn close(&self) {
        if self.core.close() {
            info!("Closed BLE peering with {}", self.device);
        }
    }
}
