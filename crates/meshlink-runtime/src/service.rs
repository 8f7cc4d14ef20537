//! The mesh service facade

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use meshlink_ble::state::BleState;
use meshlink_bonjour::{BonjourSession, MdnsDiscovery, ServiceDiscovery};
use meshlink_core::{
    EngineBuilder, EnginePaths, MeshConfig, MeshError, MeshSettings, PeerFilter, PublicKey,
    Result, RoutingEngine,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::ble_session::{BleSession, SharedPlatform};

/// Coarse lifecycle of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Default)]
struct Inner {
    engine: Option<Arc<dyn RoutingEngine>>,
    ble: Option<BleSession>,
    bonjour: Option<BonjourSession>,
    platform: Option<SharedPlatform>,
    discovery: Option<Arc<dyn ServiceDiscovery>>,
}

/// Owns the routing engine and the transport sessions
///
/// All operations serialize on one lock, so toggles never interleave with
/// `start` or `stop`.
pub struct MeshService {
    config: MeshConfig,
    settings: MeshSettings,
    paths: EnginePaths,
    engine_builder: Arc<dyn EngineBuilder>,
    system_bluetooth: bool,
    state: StdMutex<ServiceState>,
    inner: Mutex<Inner>,
}

impl MeshService {
    pub(crate) fn new(
        config: MeshConfig,
        settings: MeshSettings,
        paths: EnginePaths,
        engine_builder: Arc<dyn EngineBuilder>,
        platform: Option<SharedPlatform>,
        system_bluetooth: bool,
        discovery: Option<Arc<dyn ServiceDiscovery>>,
    ) -> Self {
        Self {
            config,
            settings,
            paths,
            engine_builder,
            system_bluetooth,
            state: StdMutex::new(ServiceState::Stopped),
            inner: Mutex::new(Inner {
                platform,
                discovery,
                ..Default::default()
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ServiceState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        debug!("Mesh service is {:?}", state);
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    fn max_frame_size(&self, engine: &dyn RoutingEngine) -> usize {
        self.config.engine.max_frame_size.min(engine.max_frame_size())
    }

    async fn engine(&self) -> Option<Arc<dyn RoutingEngine>> {
        self.inner.lock().await.engine.clone()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Create and start the engine, then apply the persisted settings. Does
    /// nothing if the engine is already running.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.engine.is_some() {
            debug!("Mesh service already running");
            return Ok(());
        }

        self.set_state(ServiceState::Starting);
        let engine = match self.create_engine() {
            Ok(engine) => engine,
            Err(e) => {
                self.set_state(ServiceState::Stopped);
                return Err(e);
            }
        };
        inner.engine = Some(engine.clone());

        engine.set_static_peer(self.settings.effective_static_peer());
        engine.set_relaying_enabled(self.settings.relaying_enabled);
        let self_relays = self.settings.self_relay_servers.trim();
        if !self_relays.is_empty() {
            engine.set_relay_servers(engine.public_key().as_str(), self_relays);
        }

        self.apply_bluetooth(&mut inner, !self.settings.bluetooth_disabled)
            .await;
        engine.set_multicast_enabled(!self.settings.multicast_disabled);
        self.apply_bonjour(&mut inner, !self.settings.bonjour_disabled)
            .await;

        self.set_state(ServiceState::Running);
        info!("Mesh service started with key {}", engine.public_key());
        Ok(())
    }

    fn create_engine(&self) -> Result<Arc<dyn RoutingEngine>> {
        let engine = self.engine_builder.build(&self.paths)?;
        info!("Storage directory: {}", self.paths.storage_dir().display());
        info!("Cache directory: {}", self.paths.cache_dir().display());
        engine.start()?;
        Ok(engine)
    }

    /// Disable every transport, reset the engine's settings and stop it.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        let Some(engine) = inner.engine.clone() else {
            return;
        };

        self.set_state(ServiceState::Stopping);
        self.apply_bluetooth(&mut inner, false).await;
        engine.set_multicast_enabled(false);
        self.apply_bonjour(&mut inner, false).await;
        engine.set_static_peer("");
        engine.set_relaying_enabled(false);

        engine.stop();
        inner.engine = None;
        self.set_state(ServiceState::Stopped);
        info!("Mesh service stopped");
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn base_url(&self) -> Option<String> {
        self.engine().await.and_then(|engine| engine.base_url())
    }

    pub async fn public_key(&self) -> Option<PublicKey> {
        self.engine().await.map(|engine| engine.public_key())
    }

    /// Connected peer summary for display
    pub async fn peers(&self) -> String {
        let Some(engine) = self.engine().await else {
            return "Dendrite is not running".to_string();
        };
        match engine.peer_count(PeerFilter::All) {
            0 => "No connectivity".to_string(),
            1 => "1 connected peer".to_string(),
            count => format!("{} connected peers", count),
        }
    }

    pub async fn is_bluetooth_enabled(&self) -> bool {
        self.inner.lock().await.ble.is_some()
    }

    pub async fn is_bonjour_enabled(&self) -> bool {
        self.inner.lock().await.bonjour.is_some()
    }

    /// Tracker of the current Bluetooth session
    pub async fn bluetooth_state(&self) -> Option<BleState> {
        self.inner
            .lock()
            .await
            .ble
            .as_ref()
            .map(|session| session.state().clone())
    }

    /// Listening address of the current local-network session
    pub async fn bonjour_addr(&self) -> Option<SocketAddr> {
        self.inner
            .lock()
            .await
            .bonjour
            .as_ref()
            .map(BonjourSession::local_addr)
    }

    // ------------------------------------------------------------------------
    // Transport Toggles
    // ------------------------------------------------------------------------

    /// Enabling always starts a fresh session. A running one is stopped
    /// first, so the new tracker and both roles pick up the current radio
    /// state.
    pub async fn set_bluetooth_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().await;
        self.apply_bluetooth(&mut inner, enabled).await;
    }

    async fn apply_bluetooth(&self, inner: &mut Inner, enabled: bool) {
        let Some(engine) = inner.engine.clone() else {
            return;
        };

        if !enabled {
            match inner.ble.take() {
                Some(session) => session.stop(engine.as_ref()).await,
                None => engine.disconnect_type(meshlink_core::PeerType::Bluetooth),
            }
            return;
        }

        if let Some(session) = inner.ble.take() {
            debug!("Bluetooth already enabled, restarting the session");
            session.stop(engine.as_ref()).await;
        }
        let Some(platform) = self.ensure_platform(inner).await else {
            return;
        };
        let max_frame_size = self.max_frame_size(engine.as_ref());
        inner.ble = Some(BleSession::start(
            &platform,
            engine,
            &self.config.ble,
            max_frame_size,
        ));
    }

    async fn ensure_platform(&self, inner: &mut Inner) -> Option<SharedPlatform> {
        if let Some(platform) = &inner.platform {
            return Some(platform.clone());
        }
        if !self.system_bluetooth {
            warn!("No Bluetooth platform configured, leaving Bluetooth off");
            return None;
        }
        match meshlink_ble::backend::open_platform().await {
            Ok(platform) => {
                let platform = SharedPlatform::from(platform);
                inner.platform = Some(platform.clone());
                Some(platform)
            }
            Err(e) => {
                error!("Bluetooth unavailable: {}", MeshError::from(e));
                None
            }
        }
    }

    pub async fn set_bonjour_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().await;
        self.apply_bonjour(&mut inner, enabled).await;
    }

    async fn apply_bonjour(&self, inner: &mut Inner, enabled: bool) {
        let Some(engine) = inner.engine.clone() else {
            return;
        };

        if !enabled {
            if let Some(session) = inner.bonjour.take() {
                session.shutdown().await;
                info!("Bonjour disabled");
            }
            return;
        }

        if inner.bonjour.is_some() {
            debug!("Bonjour already enabled");
            return;
        }
        let Some(discovery) = Self::ensure_discovery(inner) else {
            return;
        };
        let max_frame_size = self.max_frame_size(engine.as_ref());
        match BonjourSession::start(engine, discovery, &self.config.bonjour, max_frame_size).await {
            Ok(session) => {
                info!("Bonjour enabled on {}", session.local_addr());
                inner.bonjour = Some(session);
            }
            Err(e) => error!("Failed to enable Bonjour: {}", MeshError::from(e)),
        }
    }

    fn ensure_discovery(inner: &mut Inner) -> Option<Arc<dyn ServiceDiscovery>> {
        if let Some(discovery) = &inner.discovery {
            return Some(discovery.clone());
        }
        match MdnsDiscovery::new() {
            Ok(discovery) => {
                let discovery: Arc<dyn ServiceDiscovery> = Arc::new(discovery);
                inner.discovery = Some(discovery.clone());
                Some(discovery)
            }
            Err(e) => {
                error!("mDNS unavailable: {}", e);
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Engine Settings
    // ------------------------------------------------------------------------

    pub async fn set_multicast_enabled(&self, enabled: bool) {
        if let Some(engine) = self.engine().await {
            engine.set_multicast_enabled(enabled);
        }
    }

    pub async fn set_relaying_enabled(&self, enabled: bool) {
        if let Some(engine) = self.engine().await {
            engine.set_relaying_enabled(enabled);
        }
    }

    pub async fn set_static_peer(&self, uri: &str) {
        if let Some(engine) = self.engine().await {
            engine.set_static_peer(uri.trim());
        }
    }

    /// Relay servers for this node's own key
    pub async fn set_self_relay_servers(&self, uris: &str) {
        if let Some(engine) = self.engine().await {
            engine.set_relay_servers(engine.public_key().as_str(), uris.trim());
        }
    }

    pub async fn self_relay_servers(&self) -> String {
        match self.engine().await {
            Some(engine) => engine.relay_servers(engine.public_key().as_str()),
            None => String::new(),
        }
    }

    pub async fn set_relay_servers(&self, user_id: &str, uris: &str) {
        if let Some(engine) = self.engine().await {
            engine.set_relay_servers(user_id.trim(), uris.trim());
        }
    }

    pub async fn relay_servers(&self, user_id: &str) -> String {
        match self.engine().await {
            Some(engine) => engine.relay_servers(user_id.trim()),
            None => String::new(),
        }
    }
}
