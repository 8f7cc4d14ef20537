//! In-process routing engine
//!
//! `MemoryEngine` behaves like a small hub: every frame a peer writes into one
//! conduit is queued for reading on every other open conduit. It records all
//! control calls so service behaviour can be asserted, and it backs the demo
//! node in `meshlink-cli`.
//!
//! Closed conduits leave the hub. With capture enabled (the default) the
//! engine also keeps every conduit it allocated and every frame written into
//! it; long-running nodes turn capture off.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::engine::{Conduit, EngineBuilder, EnginePaths, PeerFilter, RoutingEngine};
use crate::errors::EngineError;
use crate::types::{PeerType, PublicKey};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Conduit
// ----------------------------------------------------------------------------

/// One hub port
pub struct MemoryConduit {
    id: u64,
    zone: String,
    peer_type: PeerType,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    received: Mutex<Vec<Vec<u8>>>,
    received_count: watch::Sender<usize>,
    capture: bool,
    closed: AtomicBool,
    fail_writes: AtomicBool,
    hub: Weak<HubState>,
}

impl MemoryConduit {
    fn new(id: u64, zone: &str, peer_type: PeerType, capture: bool, hub: Weak<HubState>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (received_count, _) = watch::channel(0);
        Self {
            id,
            zone: zone.to_string(),
            peer_type,
            outbound_tx: Mutex::new(Some(outbound_tx)),
            outbound_rx: Mutex::new(outbound_rx),
            received: Mutex::new(Vec::new()),
            received_count,
            capture,
            closed: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            hub,
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn peer_type(&self) -> PeerType {
        self.peer_type
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue a frame as if the switch routed it to this peer.
    pub fn inject(&self, frame: impl Into<Vec<u8>>) -> bool {
        match lock(&self.outbound_tx).as_ref() {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    /// Frames the peer has written into the switch so far; empty without
    /// capture
    pub fn received(&self) -> Vec<Vec<u8>> {
        lock(&self.received).clone()
    }

    /// All received bytes concatenated, regardless of how reads were split
    pub fn received_bytes(&self) -> Vec<u8> {
        lock(&self.received).concat()
    }

    /// Wait until at least `bytes` bytes have been written by the peer.
    pub async fn wait_for_bytes(&self, bytes: usize) -> Vec<u8> {
        let mut rx = self.received_count.subscribe();
        // The sender lives as long as the conduit, so this never errors.
        let _ = rx.wait_for(|count| *count >= bytes).await;
        self.received_bytes()
    }

    /// Make subsequent writes fail, simulating a congested or broken switch
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl fmt::Debug for MemoryConduit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConduit")
            .field("id", &self.id)
            .field("zone", &self.zone)
            .field("peer_type", &self.peer_type)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Conduit for MemoryConduit {
    fn write(&self, bytes: &[u8]) -> Result<usize, EngineError> {
        if self.is_closed() {
            return Err(EngineError::ConduitClosed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::ConduitIo("write rejected".into()));
        }

        if self.capture {
            let total = {
                let mut received = lock(&self.received);
                received.push(bytes.to_vec());
                received.iter().map(Vec::len).sum::<usize>()
            };
            self.received_count.send_replace(total);
        }

        if let Some(hub) = self.hub.upgrade() {
            hub.forward(self.id, bytes);
        }
        Ok(bytes.len())
    }

    fn read_copy(&self) -> Result<Vec<u8>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::ConduitClosed);
        }
        let frame = lock(&self.outbound_rx).blocking_recv();
        match frame {
            Some(frame) if !self.is_closed() => Ok(frame),
            _ => Err(EngineError::ConduitClosed),
        }
    }

    fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        lock(&self.outbound_tx).take();
        if let Some(hub) = self.hub.upgrade() {
            hub.detach(self.id);
        }
        debug!("Closed {} conduit {} ({})", self.peer_type, self.id, self.zone);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

#[derive(Default)]
struct ControlState {
    running: bool,
    multicast_enabled: bool,
    relaying_enabled: bool,
    static_peer: String,
    relay_servers: HashMap<String, String>,
    disconnected_types: Vec<PeerType>,
}

/// Open conduits only
#[derive(Default)]
struct HubState {
    conduits: Mutex<Vec<Arc<MemoryConduit>>>,
}

impl HubState {
    fn detach(&self, id: u64) {
        lock(&self.conduits).retain(|conduit| conduit.id != id);
    }

    fn forward(&self, from: u64, bytes: &[u8]) {
        for conduit in lock(&self.conduits).iter() {
            if conduit.id != from && !conduit.is_closed() {
                conduit.inject(bytes.to_vec());
            }
        }
    }
}

/// In-process hub engine
pub struct MemoryEngine {
    public_key: PublicKey,
    base_url: Option<String>,
    paths: Option<EnginePaths>,
    control: Mutex<ControlState>,
    hub: Arc<HubState>,
    capture: bool,
    history: Mutex<Vec<Arc<MemoryConduit>>>,
    next_conduit: AtomicU64,
    fail_conduits: AtomicBool,
}

impl MemoryEngine {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            base_url: None,
            paths: None,
            control: Mutex::new(ControlState::default()),
            hub: Arc::new(HubState::default()),
            capture: true,
            history: Mutex::new(Vec::new()),
            next_conduit: AtomicU64::new(1),
            fail_conduits: AtomicBool::new(false),
        }
    }

    /// Engine with a random 32-byte key
    pub fn with_random_key() -> Self {
        let mut bytes = Vec::with_capacity(32);
        bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self::new(PublicKey::from_bytes(&bytes))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_paths(mut self, paths: EnginePaths) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Keep allocated conduits and written frames for inspection
    pub fn with_capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    pub fn paths(&self) -> Option<&EnginePaths> {
        self.paths.as_ref()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.control).running
    }

    pub fn multicast_enabled(&self) -> bool {
        lock(&self.control).multicast_enabled
    }

    pub fn relaying_enabled(&self) -> bool {
        lock(&self.control).relaying_enabled
    }

    pub fn static_peer(&self) -> String {
        lock(&self.control).static_peer.clone()
    }

    pub fn disconnected_types(&self) -> Vec<PeerType> {
        lock(&self.control).disconnected_types.clone()
    }

    /// Every conduit ever allocated with capture on, otherwise the open ones
    pub fn conduits(&self) -> Vec<Arc<MemoryConduit>> {
        if self.capture {
            lock(&self.history).clone()
        } else {
            lock(&self.hub.conduits).clone()
        }
    }

    /// Conduits currently attached to the hub
    pub fn live_conduit_count(&self) -> usize {
        lock(&self.hub.conduits).len()
    }

    pub fn open_conduits(&self, peer_type: PeerType) -> Vec<Arc<MemoryConduit>> {
        self.conduits()
            .into_iter()
            .filter(|c| c.peer_type == peer_type && !c.is_closed())
            .collect()
    }

    /// Make subsequent conduit allocations fail
    pub fn fail_conduits(&self, fail: bool) {
        self.fail_conduits.store(fail, Ordering::SeqCst);
    }
}

impl RoutingEngine for MemoryEngine {
    fn start(&self) -> Result<(), EngineError> {
        let mut control = lock(&self.control);
        if control.running {
            return Err(EngineError::AlreadyRunning);
        }
        control.running = true;
        info!("Memory engine started with key {}", self.public_key);
        Ok(())
    }

    fn stop(&self) {
        lock(&self.control).running = false;
        for conduit in self.conduits() {
            let _ = conduit.close();
        }
        info!("Memory engine stopped");
    }

    fn public_key(&self) -> PublicKey {
        self.public_key.clone()
    }

    fn base_url(&self) -> Option<String> {
        self.base_url.clone()
    }

    fn conduit(&self, zone: &str, peer_type: PeerType) -> Result<Arc<dyn Conduit>, EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        if self.fail_conduits.load(Ordering::SeqCst) {
            return Err(EngineError::ConduitCreationFailed {
                zone: zone.to_string(),
                peer_type,
                reason: "allocation disabled".into(),
            });
        }

        let id = self.next_conduit.fetch_add(1, Ordering::Relaxed);
        let conduit = Arc::new(MemoryConduit::new(
            id,
            zone,
            peer_type,
            self.capture,
            Arc::downgrade(&self.hub),
        ));
        lock(&self.hub.conduits).push(conduit.clone());
        if self.capture {
            lock(&self.history).push(conduit.clone());
        }
        debug!("Allocated {} conduit {} in zone {}", peer_type, id, zone);
        Ok(conduit)
    }

    fn peer_count(&self, filter: PeerFilter) -> usize {
        self.conduits()
            .iter()
            .filter(|c| !c.is_closed())
            .filter(|c| match filter {
                PeerFilter::All => true,
                PeerFilter::Only(peer_type) => c.peer_type == peer_type,
            })
            .count()
    }

    fn disconnect_type(&self, peer_type: PeerType) {
        lock(&self.control).disconnected_types.push(peer_type);
        for conduit in self.open_conduits(peer_type) {
            let _ = conduit.close();
        }
    }

    fn set_multicast_enabled(&self, enabled: bool) {
        lock(&self.control).multicast_enabled = enabled;
    }

    fn set_relaying_enabled(&self, enabled: bool) {
        lock(&self.control).relaying_enabled = enabled;
    }

    fn set_static_peer(&self, uri: &str) {
        lock(&self.control).static_peer = uri.to_string();
    }

    fn set_relay_servers(&self, key: &str, uris: &str) {
        lock(&self.control)
            .relay_servers
            .insert(key.to_string(), uris.to_string());
    }

    fn relay_servers(&self, key: &str) -> String {
        lock(&self.control)
            .relay_servers
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builds [`MemoryEngine`]s and remembers them for inspection
#[derive(Default)]
pub struct MemoryEngineBuilder {
    public_key: Option<PublicKey>,
    capture_disabled: bool,
    built: Mutex<Vec<Arc<MemoryEngine>>>,
}

impl MemoryEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give every built engine the same key
    pub fn with_public_key(mut self, key: impl Into<PublicKey>) -> Self {
        self.public_key = Some(key.into());
        self
    }

    /// Whether built engines keep conduits and frames for inspection
    pub fn with_capture(mut self, capture: bool) -> Self {
        self.capture_disabled = !capture;
        self
    }

    /// The most recently built engine
    pub fn last_engine(&self) -> Option<Arc<MemoryEngine>> {
        lock(&self.built).last().cloned()
    }

    pub fn built_count(&self) -> usize {
        lock(&self.built).len()
    }
}

impl EngineBuilder for MemoryEngineBuilder {
    fn build(&self, paths: &EnginePaths) -> Result<Arc<dyn RoutingEngine>, EngineError> {
        let engine = match &self.public_key {
            Some(key) => MemoryEngine::new(key.clone()),
            None => MemoryEngine::with_random_key(),
        };
        let engine = Arc::new(
            engine
                .with_capture(!self.capture_disabled)
                .with_paths(paths.clone()),
        );
        lock(&self.built).push(engine.clone());
        Ok(engine)
    }
}
