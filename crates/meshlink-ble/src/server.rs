//! BLE peripheral role: channel publishing, handshake service and inbound channels

use std::future::Future;
use std::sync::Arc;

use meshlink_core::{PublicKey, RoutingEngine};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::peer::BlePeer;
use crate::platform::{BlePeripheralManager, PeripheralEvent, RadioState};
use crate::protocol::Handshake;
use crate::state::BleState;

/// Handles peripheral-manager events for one Bluetooth session
pub struct PeripheralRole {
    state: BleState,
    manager: Arc<dyn BlePeripheralManager>,
    engine: Arc<dyn RoutingEngine>,
    local_key: PublicKey,
    max_frame_size: usize,
}

impl PeripheralRole {
    pub fn new(
        state: BleState,
        manager: Arc<dyn BlePeripheralManager>,
        engine: Arc<dyn RoutingEngine>,
        max_frame_size: usize,
    ) -> Self {
        let local_key = engine.public_key();
        Self {
            state,
            manager,
            engine,
            local_key,
            max_frame_size,
        }
    }

    /// Process events until `shutdown` resolves, replaying the current radio
    /// state first.
    pub async fn run<F>(
        mut self,
        events: &mut mpsc::UnboundedReceiver<PeripheralEvent>,
        shutdown: F,
    ) where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let current = self.manager.radio_state();
        self.handle_event(PeripheralEvent::StateChanged(current)).await;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!("Peripheral role stopped");
    }

    pub async fn handle_event(&mut self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::StateChanged(radio) => self.on_state_changed(radio).await,
            PeripheralEvent::ChannelPublished(Ok(psm)) => {
                info!("Published L2CAP channel {}", psm);
                match Handshake::encode(psm, &self.local_key) {
                    Ok(value) => self.manager.set_service(value),
                    Err(e) => error!("Cannot build handshake value: {}", e),
                }
            }
            PeripheralEvent::ChannelPublished(Err(e)) => {
                error!("Failed to publish L2CAP channel: {}", e);
            }
            PeripheralEvent::ServiceAdded(Ok(())) => {
                debug!("Mesh service added, restarting advertising");
                if let Err(e) = self.manager.stop_advertising().await {
                    debug!("Ignoring stop advertising failure: {}", e);
                }
                if let Err(e) = self.manager.start_advertising().await {
                    error!("Failed to start advertising: {}", e);
                }
            }
            PeripheralEvent::ServiceAdded(Err(e)) => {
                error!("Failed to add mesh service: {}", e);
            }
            PeripheralEvent::InboundChannel { device, result } => match result {
                Ok(channel) => {
                    info!("Inbound L2CAP channel from {}", device);
                    if let Err(e) = BlePeer::attach(
                        &self.state,
                        self.engine.as_ref(),
                        channel,
                        self.max_frame_size,
                    ) {
                        error!("Failed to create BLE peer for {}: {}", device, e);
                        self.state.clear_all_device_state(&device);
                    }
                }
                Err(e) => {
                    warn!("Inbound channel from {} failed: {}", device, e);
                    self.state.clear_all_device_state(&device);
                }
            },
        }
    }

    async fn on_state_changed(&mut self, radio: RadioState) {
        if radio.is_powered_on() {
            info!("Peripheral manager powered on, publishing channel");
            if let Err(e) = self.manager.start_advertising().await {
                warn!("Failed to start advertising: {}", e);
            }
            self.manager.publish_channel();
        } else {
            warn!("Peripheral manager is {:?}, withdrawing mesh service", radio);
            if let Err(e) = self.manager.stop_advertising().await {
                debug!("Ignoring stop advertising failure: {}", e);
            }
            if let Err(e) = self.manager.remove_all_services().await {
                debug!("Ignoring remove services failure: {}", e);
            }
            self.state.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BleError;
    use crate::platform::BleChannel;
    use crate::state::DevicePhase;
    use crate::testing::FakePeripheralManager;
    use meshlink_core::{BleConfig, DeviceUuid, MemoryEngine, PeerFilter};

    const LOCAL: &str = "0123456789abcdef0123456789abcdef";

    fn role() -> (PeripheralRole, BleState, Arc<FakePeripheralManager>, Arc<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new(PublicKey::new(LOCAL)));
        engine.start().unwrap();
        let state = BleState::new(BleConfig::default());
        let manager = FakePeripheralManager::new(RadioState::PoweredOn);
        let role = PeripheralRole::new(state.clone(), manager.clone(), engine.clone(), 1024);
        (role, state, manager, engine)
    }

    #[tokio::test]
    async fn test_publish_service_advertise_sequence() {
        let (mut role, _state, manager, _engine) = role();

        role.handle_event(PeripheralEvent::StateChanged(RadioState::PoweredOn))
            .await;
        assert_eq!(manager.publishes(), 1);

        role.handle_event(PeripheralEvent::ChannelPublished(Ok(0x00c1)))
            .await;
        let services = manager.services();
        assert_eq!(services.len(), 1);
        let handshake = Handshake::decode(&services[0]).unwrap();
        assert_eq!(handshake.psm, 0x00c1);
        assert_eq!(handshake.key.as_str(), &LOCAL[..16]);

        manager.stop_advertising().await.unwrap();
        role.handle_event(PeripheralEvent::ServiceAdded(Ok(()))).await;
        assert!(manager.is_advertising());
    }

    #[tokio::test]
    async fn test_inbound_channel_becomes_peer() {
        let (mut role, state, _manager, engine) = role();
        let device = DeviceUuid::new("aa:bb:cc:dd:ee:ff");
        let (local, _remote) = tokio::io::duplex(256);

        role.handle_event(PeripheralEvent::InboundChannel {
            device: device.clone(),
            result: Ok(BleChannel::new(device.clone(), local)),
        })
        .await;

        assert_eq!(state.phase(&device), Some(DevicePhase::Peered));
        assert_eq!(engine.peer_count(PeerFilter::All), 1);
    }

    #[tokio::test]
    async fn test_inbound_channel_without_conduit_clears_device() {
        let (mut role, state, _manager, engine) = role();
        engine.fail_conduits(true);
        let device = DeviceUuid::new("aa:bb:cc:dd:ee:01");
        let (local, _remote) = tokio::io::duplex(256);

        role.handle_event(PeripheralEvent::InboundChannel {
            device: device.clone(),
            result: Ok(BleChannel::new(device.clone(), local)),
        })
        .await;

        assert_eq!(state.phase(&device), None);
        assert_eq!(engine.peer_count(PeerFilter::All), 0);
    }

    #[tokio::test]
    async fn test_power_off_withdraws_service_and_peers() {
        let (mut role, state, manager, engine) = role();
        role.handle_event(PeripheralEvent::StateChanged(RadioState::PoweredOn))
            .await;
        role.handle_event(PeripheralEvent::ChannelPublished(Ok(0x0081)))
            .await;
        let device = DeviceUuid::new("peer");
        let (local, _remote) = tokio::io::duplex(256);
        role.handle_event(PeripheralEvent::InboundChannel {
            device: device.clone(),
            result: Ok(BleChannel::new(device.clone(), local)),
        })
        .await;

        role.handle_event(PeripheralEvent::StateChanged(RadioState::PoweredOff))
            .await;

        assert!(!manager.is_advertising());
        assert_eq!(manager.removals(), 1);
        assert!(manager.services().is_empty());
        assert_eq!(state.device_count(), 0);
        assert_eq!(engine.peer_count(PeerFilter::All), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_fatal() {
        let (mut role, state, manager, _engine) = role();
        role.handle_event(PeripheralEvent::ChannelPublished(Err(BleError::PublishFailed(
            "no psm".into(),
        ))))
        .await;
        assert!(manager.services().is_empty());
        assert_eq!(state.device_count(), 0);
    }
}
