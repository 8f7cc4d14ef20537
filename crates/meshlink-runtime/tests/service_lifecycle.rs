//! Mesh service lifecycle against the in-process engine and fake transports

use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshlink_ble::testing::FakeStack;
use meshlink_ble::{BleCentral, BleChannel, PeripheralEvent, RadioState};
use meshlink_bonjour::{BrowseEvent, ServiceDiscovery, ServiceRecord};
use meshlink_core::{
    DeviceUuid, EnginePaths, MeshConfig, MeshError, MeshSettings, MemoryEngine,
    MemoryEngineBuilder, PeerType, RoutingEngine,
};
use meshlink_runtime::{MeshService, MeshServiceBuilder, ServiceState};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const KEY: &str = "abababababababababababababababababababababababababababababababab";

#[derive(Default)]
struct RecordingDiscovery {
    registered: Mutex<Vec<ServiceRecord>>,
    unregistered: Mutex<Vec<ServiceRecord>>,
    browse: Mutex<Option<mpsc::UnboundedSender<BrowseEvent>>>,
}

impl ServiceDiscovery for RecordingDiscovery {
    fn register(&self, record: &ServiceRecord) -> meshlink_bonjour::Result<()> {
        self.registered.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn unregister(&self, record: &ServiceRecord) -> meshlink_bonjour::Result<()> {
        self.unregistered.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn browse(
        &self,
        _service_type: &str,
    ) -> meshlink_bonjour::Result<mpsc::UnboundedReceiver<BrowseEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.browse.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    fn stop_browse(&self, _service_type: &str) -> meshlink_bonjour::Result<()> {
        Ok(())
    }
}

struct Node {
    service: MeshService,
    engines: Arc<MemoryEngineBuilder>,
    stack: FakeStack,
    discovery: Arc<RecordingDiscovery>,
}

impl Node {
    fn engine(&self) -> Arc<MemoryEngine> {
        self.engines.last_engine().expect("engine not built")
    }
}

fn node(settings: MeshSettings) -> Node {
    let engines = Arc::new(MemoryEngineBuilder::new().with_public_key(KEY));
    let (stack, platform) = FakeStack::new(RadioState::PoweredOn);
    let discovery = Arc::new(RecordingDiscovery::default());
    let mut config = MeshConfig::default();
    config.bonjour.listen_addr = "127.0.0.1:0".parse().unwrap();

    let service = MeshServiceBuilder::new()
        .with_config(config)
        .with_settings(settings)
        .with_paths(EnginePaths::new("/tmp/meshlink-test/storage", "/tmp/meshlink-test/cache"))
        .with_engine_builder(engines.clone())
        .with_ble_platform(platform)
        .with_discovery(discovery.clone())
        .build()
        .unwrap();

    Node {
        service,
        engines,
        stack,
        discovery,
    }
}

fn quiet_settings() -> MeshSettings {
    MeshSettings {
        bluetooth_disabled: true,
        bonjour_disabled: true,
        ..Default::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_peer_summary_follows_lifecycle() {
    let node = node(quiet_settings());
    assert_eq!(node.service.peers().await, "Dendrite is not running");
    assert_eq!(node.service.state(), ServiceState::Stopped);

    node.service.start().await.unwrap();
    assert_eq!(node.service.state(), ServiceState::Running);
    assert_eq!(node.service.peers().await, "No connectivity");

    let engine = node.engine();
    let _first = engine.conduit("a", PeerType::Static).unwrap();
    assert_eq!(node.service.peers().await, "1 connected peer");
    let _second = engine.conduit("b", PeerType::Static).unwrap();
    assert_eq!(node.service.peers().await, "2 connected peers");

    node.service.stop().await;
    assert_eq!(node.service.state(), ServiceState::Stopped);
    assert_eq!(node.service.peers().await, "Dendrite is not running");
}

#[tokio::test]
async fn test_start_is_idempotent_and_applies_settings() {
    let node = node(MeshSettings {
        static_peer_enabled: true,
        static_peer_uri: "  tcp://relay.example:7000 ".into(),
        relaying_enabled: true,
        multicast_disabled: true,
        self_relay_servers: " https://relay.example ".into(),
        ..quiet_settings()
    });

    node.service.start().await.unwrap();
    node.service.start().await.unwrap();
    assert_eq!(node.engines.built_count(), 1);

    let engine = node.engine();
    assert!(engine.is_running());
    assert_eq!(engine.static_peer(), "tcp://relay.example:7000");
    assert!(engine.relaying_enabled());
    assert!(!engine.multicast_enabled());
    assert_eq!(node.service.self_relay_servers().await, "https://relay.example");
    assert_eq!(
        engine.paths().unwrap().storage_dir().to_str(),
        Some("/tmp/meshlink-test/storage")
    );
    assert_eq!(node.service.public_key().await.unwrap().as_str(), KEY);
}

#[tokio::test]
async fn test_stop_resets_engine_settings() {
    let node = node(MeshSettings {
        static_peer_enabled: true,
        static_peer_uri: "tcp://relay.example:7000".into(),
        relaying_enabled: true,
        bonjour_disabled: true,
        ..Default::default()
    });
    node.service.start().await.unwrap();
    let engine = node.engine();
    assert!(engine.multicast_enabled());

    node.service.stop().await;

    assert!(!engine.is_running());
    assert_eq!(engine.static_peer(), "");
    assert!(!engine.relaying_enabled());
    assert!(!engine.multicast_enabled());
    assert!(engine.disconnected_types().contains(&PeerType::Bluetooth));
    assert!(!node.service.is_bluetooth_enabled().await);

    // a second stop has nothing to do
    node.service.stop().await;
    assert_eq!(node.engines.built_count(), 1);
}

#[tokio::test]
async fn test_toggles_without_engine_are_ignored() {
    let node = node(quiet_settings());
    node.service.set_static_peer("tcp://x:1").await;
    node.service.set_relaying_enabled(true).await;
    node.service.set_multicast_enabled(true).await;
    node.service.set_relay_servers("user", "uri").await;
    node.service.set_bluetooth_enabled(true).await;
    node.service.set_bonjour_enabled(true).await;

    assert_eq!(node.service.relay_servers("user").await, "");
    assert_eq!(node.service.self_relay_servers().await, "");
    assert!(node.service.base_url().await.is_none());
    assert!(!node.service.is_bluetooth_enabled().await);
    assert!(!node.service.is_bonjour_enabled().await);
    assert_eq!(node.engines.built_count(), 0);
}

#[tokio::test]
async fn test_relay_servers_are_trimmed() {
    let node = node(quiet_settings());
    node.service.start().await.unwrap();

    node.service
        .set_relay_servers(" @alice:example ", " https://a.example ")
        .await;
    assert_eq!(
        node.service.relay_servers("@alice:example").await,
        "https://a.example"
    );
    assert_eq!(
        node.service.relay_servers("  @alice:example").await,
        "https://a.example"
    );

    node.service.set_self_relay_servers("https://me.example  ").await;
    assert_eq!(node.service.self_relay_servers().await, "https://me.example");
}

#[tokio::test]
async fn test_bluetooth_session_scans_and_advertises() {
    let node = node(MeshSettings {
        bonjour_disabled: true,
        ..Default::default()
    });
    node.service.start().await.unwrap();
    assert!(node.service.is_bluetooth_enabled().await);

    let stack = node.stack.clone();
    eventually(|| stack.central.scans_started() == 1 && stack.peripheral.publishes() == 1).await;
    assert!(stack.peripheral.is_advertising());

    node.service.set_bluetooth_enabled(false).await;
    assert!(!node.service.is_bluetooth_enabled().await);
    assert!(!stack.central.is_scanning());
    assert!(!stack.peripheral.is_advertising());
    assert!(stack.peripheral.removals() >= 1);
    assert!(node.engine().disconnected_types().contains(&PeerType::Bluetooth));

    node.service.set_bluetooth_enabled(true).await;
    eventually(|| stack.central.scans_started() == 2).await;
}

#[tokio::test]
async fn test_enabling_bluetooth_again_restarts_the_session() {
    let node = node(MeshSettings {
        bonjour_disabled: true,
        ..Default::default()
    });
    node.service.start().await.unwrap();
    let engine = node.engine();
    let stack = node.stack.clone();
    eventually(|| stack.central.scans_started() == 1).await;

    let device = DeviceUuid::new("11:22:33:44:55:66");
    let (local, _remote) = tokio::io::duplex(1024);
    node.stack.peripheral_event(PeripheralEvent::InboundChannel {
        device: device.clone(),
        result: Ok(BleChannel::new(device.clone(), local)),
    });
    eventually(|| engine.open_conduits(PeerType::Bluetooth).len() == 1).await;
    let first = node.service.bluetooth_state().await.unwrap();

    node.service.set_bluetooth_enabled(true).await;
    assert!(node.service.is_bluetooth_enabled().await);
    assert_eq!(first.device_count(), 0);
    assert!(engine.open_conduits(PeerType::Bluetooth).is_empty());

    // the new roles read the radio state again and resume scanning
    eventually(|| stack.central.scans_started() == 2 && stack.peripheral.is_advertising()).await;
    let second = node.service.bluetooth_state().await.unwrap();
    assert_eq!(second.device_count(), 0);
}

#[tokio::test]
async fn test_bonjour_reads_are_cut_at_configured_frame_size() {
    let engines = Arc::new(MemoryEngineBuilder::new().with_public_key(KEY));
    let discovery = Arc::new(RecordingDiscovery::default());
    let mut config = MeshConfig::default().with_max_frame_size(4);
    config.bonjour.listen_addr = "127.0.0.1:0".parse().unwrap();
    let service = MeshServiceBuilder::new()
        .with_config(config)
        .with_settings(MeshSettings {
            bluetooth_disabled: true,
            ..Default::default()
        })
        .with_paths(EnginePaths::new("/tmp/meshlink-test/storage", "/tmp/meshlink-test/cache"))
        .with_engine_builder(engines.clone())
        .with_discovery(discovery)
        .build()
        .unwrap();
    service.start().await.unwrap();

    let addr = service.bonjour_addr().await.unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();
    let engine = engines.last_engine().unwrap();
    eventually(|| engine.open_conduits(PeerType::Bonjour).len() == 1).await;
    client.write_all(b"0123456789").await.unwrap();

    let conduit = engine.open_conduits(PeerType::Bonjour)[0].clone();
    assert_eq!(conduit.wait_for_bytes(10).await, b"0123456789");
    assert!(conduit.received().iter().all(|frame| frame.len() <= 4));
    service.stop().await;
}

#[tokio::test]
async fn test_disabling_bluetooth_drops_ble_peers() {
    let node = node(MeshSettings {
        bonjour_disabled: true,
        ..Default::default()
    });
    node.service.start().await.unwrap();
    let engine = node.engine();

    let device = DeviceUuid::new("11:22:33:44:55:66");
    let (local, _remote) = tokio::io::duplex(1024);
    node.stack.peripheral_event(PeripheralEvent::InboundChannel {
        device: device.clone(),
        result: Ok(BleChannel::new(device.clone(), local)),
    });

    eventually(|| engine.open_conduits(PeerType::Bluetooth).len() == 1).await;
    assert_eq!(node.service.peers().await, "1 connected peer");
    let tracker = node.service.bluetooth_state().await.unwrap();
    assert!(tracker.is_connected_device(&device));

    node.service.set_bluetooth_enabled(false).await;
    assert!(engine.open_conduits(PeerType::Bluetooth).is_empty());
    assert_eq!(tracker.device_count(), 0);
    assert_eq!(node.service.peers().await, "No connectivity");
}

#[tokio::test]
async fn test_bonjour_session_announces_and_accepts() {
    let node = node(MeshSettings {
        bluetooth_disabled: true,
        ..Default::default()
    });
    node.service.start().await.unwrap();
    let addr = node.service.bonjour_addr().await.unwrap();

    let registered = node.discovery.registered.lock().unwrap().clone();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].instance, &KEY[..16]);
    assert_eq!(registered[0].txt.get("key").map(String::as_str), Some(KEY));
    assert_eq!(registered[0].port, addr.port());

    let mut client = TcpStream::connect(addr).await.unwrap();
    let engine = node.engine();
    eventually(|| engine.open_conduits(PeerType::Bonjour).len() == 1).await;
    client.write_all(b"hello").await.unwrap();
    let conduit = engine.open_conduits(PeerType::Bonjour)[0].clone();
    assert_eq!(conduit.wait_for_bytes(5).await, b"hello");

    node.service.set_bonjour_enabled(false).await;
    assert!(conduit.is_closed());
    assert_eq!(node.discovery.unregistered.lock().unwrap().len(), 1);
    assert!(node.service.bonjour_addr().await.is_none());
}

#[tokio::test]
async fn test_no_bluetooth_platform_leaves_bluetooth_off() {
    let engines = Arc::new(MemoryEngineBuilder::new());
    let service = MeshServiceBuilder::new()
        .with_engine_builder(engines.clone())
        .with_system_bluetooth(false)
        .with_settings(MeshSettings {
            bonjour_disabled: true,
            ..Default::default()
        })
        .build()
        .unwrap();

    service.start().await.unwrap();
    assert!(!service.is_bluetooth_enabled().await);
    assert_eq!(service.peers().await, "No connectivity");
    service.stop().await;
}

#[test]
fn test_builder_requires_engine_and_valid_config() {
    let missing = MeshServiceBuilder::new().build();
    assert!(matches!(missing, Err(MeshError::Configuration(_))));

    let invalid = MeshServiceBuilder::new()
        .with_engine_builder(Arc::new(MemoryEngineBuilder::new()))
        .with_config(MeshConfig::default().with_max_frame_size(0))
        .build();
    assert!(matches!(invalid, Err(MeshError::Configuration(_))));
}
