//! BLE central role: scanning, handshake and outbound L2CAP channels

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use meshlink_core::{DeviceUuid, PublicKey, RoutingEngine};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::peer::BlePeer;
use crate::platform::{BleCentral, BleChannel, CentralEvent, PeripheralRef, RadioState};
use crate::protocol::{Handshake, TieBreak, MESH_SERVICE_UUID};
use crate::state::BleState;

// ----------------------------------------------------------------------------
// Central Role
// ----------------------------------------------------------------------------

/// Handles central-manager events for one Bluetooth session
pub struct CentralRole {
    state: BleState,
    central: Arc<dyn BleCentral>,
    engine: Arc<dyn RoutingEngine>,
    local_key: PublicKey,
    max_frame_size: usize,
    last_attempts: HashMap<DeviceUuid, Instant>,
}

impl CentralRole {
    pub fn new(
        state: BleState,
        central: Arc<dyn BleCentral>,
        engine: Arc<dyn RoutingEngine>,
        max_frame_size: usize,
    ) -> Self {
        let local_key = engine.public_key();
        Self {
            state,
            central,
            engine,
            local_key,
            max_frame_size,
            last_attempts: HashMap::new(),
        }
    }

    /// Process events until `shutdown` resolves or the channel closes.
    ///
    /// The current radio state is replayed first, so a session created while
    /// the radio is already on starts scanning straight away.
    pub async fn run<F>(mut self, events: &mut mpsc::UnboundedReceiver<CentralEvent>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let current = self.central.radio_state();
        self.handle_event(CentralEvent::StateChanged(current)).await;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!("Central role stopped");
    }

    pub async fn handle_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::StateChanged(radio) => self.on_state_changed(radio).await,
            CentralEvent::Discovered(peripheral) => self.on_discovered(peripheral),
            CentralEvent::Connected(device) => self.on_connected(&device),
            CentralEvent::FailedToConnect { device, reason } => {
                warn!("Failed to connect to {}: {}", device, reason);
                self.state.clear_all_device_state(&device);
            }
            CentralEvent::Disconnected(device) => {
                // duplicates of a linked key are disconnected on purpose and
                // stay registered; a live peer cleans up through its own stop
                if self.state.holds_live_key(&device) {
                    debug!("Disconnected from {}, key still linked", device);
                    return;
                }
                info!("Disconnected from {}", device);
                self.state.clear_all_device_state(&device);
            }
            CentralEvent::HandshakeDiscovered { device, result } => {
                self.on_handshake_discovered(&device, result)
            }
            CentralEvent::HandshakeRead { device, result } => self.on_handshake_read(&device, result),
            CentralEvent::ChannelOpened { device, result } => self.on_channel_opened(&device, result),
        }
    }

    async fn on_state_changed(&mut self, radio: RadioState) {
        if radio.is_powered_on() {
            if self.central.is_scanning() {
                debug!("Already scanning");
                return;
            }
            match self.central.start_scan(MESH_SERVICE_UUID).await {
                Ok(()) => info!("Started scanning for mesh peers"),
                Err(e) => error!("Failed to start scanning: {}", e),
            }
        } else {
            warn!("Central manager is {:?}, dropping all BLE state", radio);
            if let Err(e) = self.central.stop_scan().await {
                debug!("Ignoring stop scan failure: {}", e);
            }
            self.last_attempts.clear();
            self.state.clear();
        }
    }

    fn on_discovered(&mut self, peripheral: PeripheralRef) {
        let device = peripheral.device();
        if self.state.is_connecting_or_connected(&device) {
            return;
        }

        let now = Instant::now();
        let interval = self.state.config().rediscovery_interval;
        if let Some(last) = self.last_attempts.get(&device) {
            if now.duration_since(*last) < interval {
                debug!("Rate limiting connection attempt to {}", device);
                return;
            }
        }
        self.last_attempts
            .retain(|_, last| now.duration_since(*last) < interval);
        self.last_attempts.insert(device.clone(), now);

        info!("Discovered {}, connecting", device);
        self.state.add_found_peripheral(&device, peripheral.clone());
        peripheral.connect();
    }

    fn on_connected(&mut self, device: &DeviceUuid) {
        if self.state.is_connected_device(device) {
            debug!("Already peered with {}", device);
            return;
        }
        match self.state.peripheral(device) {
            Some(peripheral) => {
                debug!("Connected to {}, discovering handshake", device);
                peripheral.discover_handshake();
            }
            None => debug!("Connected to untracked device {}", device),
        }
    }

    fn on_handshake_discovered(&mut self, device: &DeviceUuid, result: Result<()>) {
        if let Err(e) = result {
            warn!("Handshake discovery failed for {}: {}", device, e);
            self.state.clear_all_device_state(device);
            return;
        }
        if let Some(peripheral) = self.state.peripheral(device) {
            peripheral.read_handshake();
        }
    }

    fn on_handshake_read(&mut self, device: &DeviceUuid, result: Result<Vec<u8>>) {
        let handshake = match result.and_then(|value| Handshake::decode(&value)) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("Rejecting handshake from {}: {}", device, e);
                self.state.clear_all_device_state(device);
                return;
            }
        };

        match handshake.initiator(&self.local_key) {
            TieBreak::RemoteInitiates => {
                info!(
                    "{} ({}) will open the channel to us",
                    device, handshake.key
                );
                self.state.stop_timer(device);
            }
            TieBreak::LocalInitiates => self.initiate_channel(device, handshake),
        }
    }

    fn initiate_channel(&mut self, device: &DeviceUuid, handshake: Handshake) {
        if handshake.psm == 0 {
            warn!("{} advertised an invalid PSM", device);
            self.state.clear_all_device_state(device);
            return;
        }

        if self.state.is_connected_key(&handshake.key) {
            info!("Already connected to {} through another device", handshake.key);
            self.state.register_device(device, &handshake.key);
            self.state.clear_device_connecting_state(device);
            return;
        }

        self.state.register_device(device, &handshake.key);
        if !self.state.add_connecting_channel(device, handshake.psm) {
            return;
        }
        match self.state.peripheral(device) {
            Some(peripheral) => {
                info!("Opening L2CAP channel {} to {}", handshake.psm, device);
                peripheral.open_channel(handshake.psm);
            }
            None => self.state.clear_all_device_state(device),
        }
    }

    fn on_channel_opened(&mut self, device: &DeviceUuid, result: Result<BleChannel>) {
        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to open channel to {}: {}", device, e);
                self.state.clear_all_device_state(device);
                return;
            }
        };

        if let Err(e) = BlePeer::attach(
            &self.state,
            self.engine.as_ref(),
            channel,
            self.max_frame_size,
        ) {
            error!("Failed to create BLE peer for {}: {}", device, e);
            self.state.clear_all_device_state(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BleError;
    use crate::platform::PeripheralLink;
    use crate::state::DevicePhase;
    use crate::testing::{FakeCentral, FakePeripheral, PeripheralCommand};
    use meshlink_core::{BleConfig, MemoryEngine, PeerFilter, PeerType};
    use std::time::Duration;

    const LOCAL: &str = "5555555555555555555555555555555555555555555555555555555555555555";

    struct Harness {
        role: CentralRole,
        state: BleState,
        engine: Arc<MemoryEngine>,
        central: Arc<FakeCentral>,
    }

    fn harness(local: &str) -> Harness {
        let engine = Arc::new(MemoryEngine::new(PublicKey::new(local)));
        engine.start().unwrap();
        let state = BleState::new(BleConfig::default());
        let central = FakeCentral::new(RadioState::PoweredOn);
        let role = CentralRole::new(state.clone(), central.clone(), engine.clone(), 1024);
        Harness {
            role,
            state,
            engine,
            central,
        }
    }

    fn handshake(psm: u16, key: &str) -> Vec<u8> {
        Handshake::encode(psm, &PublicKey::new(key)).unwrap()
    }

    impl Harness {
        /// Drive a device from discovery up to (not including) the handshake read
        async fn connect(&mut self, peripheral: &Arc<FakePeripheral>) {
            let device = peripheral.device();
            self.role
                .handle_event(CentralEvent::Discovered(peripheral.clone()))
                .await;
            self.role
                .handle_event(CentralEvent::Connected(device.clone()))
                .await;
            self.role
                .handle_event(CentralEvent::HandshakeDiscovered {
                    device,
                    result: Ok(()),
                })
                .await;
        }

        async fn read(&mut self, peripheral: &Arc<FakePeripheral>, value: Vec<u8>) {
            self.role
                .handle_event(CentralEvent::HandshakeRead {
                    device: peripheral.device(),
                    result: Ok(value),
                })
                .await;
        }

        async fn open(&mut self, peripheral: &Arc<FakePeripheral>) -> tokio::io::DuplexStream {
            let (local, remote) = tokio::io::duplex(1024);
            let device = peripheral.device();
            self.role
                .handle_event(CentralEvent::ChannelOpened {
                    device: device.clone(),
                    result: Ok(BleChannel::new(device, local)),
                })
                .await;
            remote
        }
    }

    #[tokio::test]
    async fn test_powered_on_starts_scan_once() {
        let mut h = harness(LOCAL);
        h.role
            .handle_event(CentralEvent::StateChanged(RadioState::PoweredOn))
            .await;
        h.role
            .handle_event(CentralEvent::StateChanged(RadioState::PoweredOn))
            .await;
        assert_eq!(h.central.scans_started(), 1);
        assert!(h.central.is_scanning());
    }

    #[tokio::test]
    async fn test_handshake_commands_follow_events() {
        let mut h = harness(LOCAL);
        let peripheral = FakePeripheral::new("x");
        h.connect(&peripheral).await;

        assert_eq!(
            peripheral.commands(),
            vec![
                PeripheralCommand::Connect,
                PeripheralCommand::DiscoverHandshake,
                PeripheralCommand::ReadHandshake,
            ]
        );
        assert_eq!(h.state.phase(&peripheral.device()), Some(DevicePhase::Connecting));
    }

    #[tokio::test]
    async fn test_higher_remote_key_opens_channel() {
        let mut h = harness(LOCAL);
        let peripheral = FakePeripheral::new("x");
        h.connect(&peripheral).await;
        h.read(&peripheral, handshake(0x0081, "ffffffffffffffff")).await;

        assert_eq!(
            peripheral.commands().last(),
            Some(&PeripheralCommand::OpenChannel(0x0081))
        );
        assert_eq!(
            h.state.phase(&peripheral.device()),
            Some(DevicePhase::ChannelPending { psm: 0x0081 })
        );
        assert_eq!(
            h.state.devices_for_key(&PublicKey::new("ffffffffffffffff")),
            vec![peripheral.device()]
        );
    }

    #[tokio::test]
    async fn test_lower_remote_key_waits_for_remote() {
        let mut h = harness(LOCAL);
        let peripheral = FakePeripheral::new("y");
        h.connect(&peripheral).await;
        assert!(h.state.has_timer(&peripheral.device()));

        h.read(&peripheral, handshake(0x0081, "1111111111111111")).await;

        assert!(!peripheral.opened_channel());
        assert!(!h.state.has_timer(&peripheral.device()));
        assert_eq!(h.state.phase(&peripheral.device()), Some(DevicePhase::Connecting));

        // a rediscovery of the same device is ignored rather than retried
        h.role
            .handle_event(CentralEvent::Discovered(peripheral.clone()))
            .await;
        assert_eq!(peripheral.cancels(), 0);
        assert_eq!(
            peripheral
                .commands()
                .iter()
                .filter(|c| **c == PeripheralCommand::Connect)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_equal_keys_do_not_initiate() {
        let mut h = harness(LOCAL);
        let peripheral = FakePeripheral::new("twin");
        h.connect(&peripheral).await;
        h.read(&peripheral, handshake(0x0081, &LOCAL[..16].to_uppercase())).await;
        assert!(!peripheral.opened_channel());
    }

    #[tokio::test]
    async fn test_short_handshake_is_rejected() {
        let mut h = harness(LOCAL);
        let peripheral = FakePeripheral::new("d");
        h.connect(&peripheral).await;

        let mut value = handshake(0x0081, "ffffffffffffffff");
        value.pop();
        h.read(&peripheral, value).await;

        assert!(!peripheral.opened_channel());
        assert_eq!(h.state.phase(&peripheral.device()), None);
        assert_eq!(peripheral.cancels(), 1);
        assert_eq!(h.engine.peer_count(PeerFilter::All), 0);
    }

    #[tokio::test]
    async fn test_zero_psm_is_rejected() {
        let mut h = harness(LOCAL);
        let peripheral = FakePeripheral::new("z");
        h.connect(&peripheral).await;
        h.read(&peripheral, handshake(0, "ffffffffffffffff")).await;

        assert!(!peripheral.opened_channel());
        assert_eq!(h.state.phase(&peripheral.device()), None);
    }

    #[tokio::test]
    async fn test_second_device_for_connected_key_is_not_opened() {
        let mut h = harness(LOCAL);
        let key = "eeeeeeeeeeeeeeee";

        let first = FakePeripheral::new("x1");
        h.connect(&first).await;
        h.read(&first, handshake(0x0081, key)).await;
        let _remote = h.open(&first).await;
        assert!(h.state.is_connected_key(&PublicKey::new(key)));

        let second = FakePeripheral::new("x2");
        h.connect(&second).await;
        h.read(&second, handshake(0x0082, key)).await;

        assert!(!second.opened_channel());
        assert_eq!(h.state.phase(&second.device()), Some(DevicePhase::Discovered));
        assert!(!h.state.has_timer(&second.device()));
        assert_eq!(second.cancels(), 1);
        assert_eq!(h.engine.peer_count(PeerFilter::Only(PeerType::Bluetooth)), 1);
        assert_eq!(
            h.state.devices_for_key(&PublicKey::new(key)),
            vec![first.device(), second.device()]
        );
    }

    #[tokio::test]
    async fn test_channel_peer_lifecycle() {
        let mut h = harness(LOCAL);
        let peripheral = FakePeripheral::new("p");
        h.connect(&peripheral).await;
        h.read(&peripheral, handshake(0x0081, "ffffffffffffffff")).await;
        let remote = h.open(&peripheral).await;

        assert_eq!(h.state.phase(&peripheral.device()), Some(DevicePhase::Peered));
        assert!(!h.state.has_timer(&peripheral.device()));
        assert_eq!(h.engine.peer_count(PeerFilter::Only(PeerType::Bluetooth)), 1);

        drop(remote);
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.state.phase(&peripheral.device()).is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.engine.peer_count(PeerFilter::All), 0);
    }

    #[tokio::test]
    async fn test_failed_channel_clears_device() {
        let mut h = harness(LOCAL);
        let peripheral = FakePeripheral::new("f");
        h.connect(&peripheral).await;
        h.read(&peripheral, handshake(0x0081, "ffffffffffffffff")).await;
        h.role
            .handle_event(CentralEvent::ChannelOpened {
                device: peripheral.device(),
                result: Err(BleError::ChannelFailed("refused".into())),
            })
            .await;

        assert_eq!(h.state.phase(&peripheral.device()), None);
        assert!(h
            .state
            .devices_for_key(&PublicKey::new("ffffffffffffffff"))
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscovery_is_rate_limited() {
        let mut h = harness(LOCAL);
        let peripheral = FakePeripheral::new("r");
        let device = peripheral.device();
        fn connects(p: &FakePeripheral) -> usize {
            p.commands()
                .iter()
                .filter(|c| **c == PeripheralCommand::Connect)
                .count()
        }

        h.role
            .handle_event(CentralEvent::Discovered(peripheral.clone()))
            .await;
        h.role
            .handle_event(CentralEvent::FailedToConnect {
                device: device.clone(),
                reason: "busy".into(),
            })
            .await;
        h.role
            .handle_event(CentralEvent::Discovered(peripheral.clone()))
            .await;
        assert_eq!(connects(&peripheral), 1);

        tokio::time::advance(Duration::from_millis(2100)).await;
        h.role
            .handle_event(CentralEvent::Discovered(peripheral.clone()))
            .await;
        assert_eq!(connects(&peripheral), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_attempts_are_forgotten() {
        let mut h = harness(LOCAL);
        for name in ["a1", "a2", "a3"] {
            let peripheral = FakePeripheral::new(name);
            h.role
                .handle_event(CentralEvent::Discovered(peripheral.clone()))
                .await;
            h.state.clear_all_device_state(&peripheral.device());
        }
        assert_eq!(h.role.last_attempts.len(), 3);

        tokio::time::advance(Duration::from_millis(2100)).await;
        let late = FakePeripheral::new("a4");
        h.role
            .handle_event(CentralEvent::Discovered(late.clone()))
            .await;
        assert_eq!(h.role.last_attempts.len(), 1);
        assert!(h.role.last_attempts.contains_key(&late.device()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_duplicate_is_not_reconnected() {
        let mut h = harness(LOCAL);
        let key = PublicKey::new("eeeeeeeeeeeeeeee");
        fn connects(p: &FakePeripheral) -> usize {
            p.commands()
                .iter()
                .filter(|c| **c == PeripheralCommand::Connect)
                .count()
        }

        let first = FakePeripheral::new("d1");
        h.connect(&first).await;
        h.read(&first, handshake(0x0081, key.as_str())).await;
        let _remote = h.open(&first).await;

        let second = FakePeripheral::new("d2");
        h.connect(&second).await;
        h.read(&second, handshake(0x0082, key.as_str())).await;
        assert_eq!(second.cancels(), 1);

        // the cancelled duplicate reports its disconnect
        h.role
            .handle_event(CentralEvent::Disconnected(second.device()))
            .await;
        assert_eq!(h.state.key_of(&second.device()), Some(key.clone()));
        assert_eq!(
            h.state.devices_for_key(&key),
            vec![first.device(), second.device()]
        );

        tokio::time::advance(Duration::from_millis(2100)).await;
        h.role
            .handle_event(CentralEvent::Discovered(second.clone()))
            .await;
        assert_eq!(connects(&second), 1);

        // a link-level disconnect leaves the open channel alone
        h.role
            .handle_event(CentralEvent::Disconnected(first.device()))
            .await;
        assert_eq!(h.state.phase(&first.device()), Some(DevicePhase::Peered));
        assert_eq!(h.engine.peer_count(PeerFilter::Only(PeerType::Bluetooth)), 1);
    }

    #[tokio::test]
    async fn test_power_off_clears_devices_mid_handshake() {
        let mut h = harness(LOCAL);
        let peripherals: Vec<_> = ["e1", "e2", "e3"]
            .into_iter()
            .map(FakePeripheral::new)
            .collect();
        for peripheral in &peripherals {
            h.connect(peripheral).await;
            peripheral.set_powered(false);
        }
        assert_eq!(h.state.device_count(), 3);

        h.role
            .handle_event(CentralEvent::StateChanged(RadioState::PoweredOff))
            .await;

        assert_eq!(h.state.device_count(), 0);
        for peripheral in &peripherals {
            assert_eq!(peripheral.cancels(), 1);
        }
        assert!(!h.central.is_scanning());
    }

    #[tokio::test]
    async fn test_disconnect_clears_device() {
        let mut h = harness(LOCAL);
        let peripheral = FakePeripheral::new("gone");
        h.connect(&peripheral).await;
        h.role
            .handle_event(CentralEvent::Disconnected(peripheral.device()))
            .await;
        assert_eq!(h.state.phase(&peripheral.device()), None);
    }
}
