//! Per-device BLE connection tracking
//!
//! `BleState` is the single authority over which devices are being connected,
//! which have a channel in flight and which are peered. Both roles and every
//! timeout task go through its one lock, so callbacks from independent sources
//! never race on a device record.
//!
//! Peers are closed and peripheral connections cancelled only after the lock
//! is released: closing a peer runs its stop hook, which calls back into the
//! tracker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use meshlink_core::{BleConfig, DeviceUuid, LinkId, PeerTransport, PublicKey};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::platform::PeripheralRef;

// ----------------------------------------------------------------------------
// Device Records
// ----------------------------------------------------------------------------

/// Lifecycle of one tracked device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePhase {
    /// Known (for example by key) but no connection attempt in flight
    Discovered,
    /// OS-level connect and handshake read in progress
    Connecting,
    /// Outbound L2CAP channel requested
    ChannelPending { psm: u16 },
    /// A peer transport is attached
    Peered,
}

struct DeviceTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl DeviceTimer {
    fn cancel(self) {
        self.handle.abort();
    }
}

struct DeviceRecord {
    phase: DevicePhase,
    peripheral: Option<PeripheralRef>,
    peer: Option<Arc<dyn PeerTransport>>,
    timer: Option<DeviceTimer>,
    key: Option<PublicKey>,
}

impl DeviceRecord {
    fn new(phase: DevicePhase) -> Self {
        Self {
            phase,
            peripheral: None,
            peer: None,
            timer: None,
            key: None,
        }
    }
}

/// Handles released by a cleanup, to be shut down outside the lock
#[derive(Default)]
struct Released {
    peers: Vec<Arc<dyn PeerTransport>>,
    peripherals: Vec<PeripheralRef>,
}

impl Released {
    fn take(&mut self, record: DeviceRecord) {
        if let Some(timer) = record.timer {
            timer.cancel();
        }
        self.peers.extend(record.peer);
        self.peripherals.extend(record.peripheral);
    }

    fn shut_down(self) {
        for peer in self.peers {
            if peer.is_open() {
                peer.close();
            }
        }
        for peripheral in self.peripherals {
            if let Err(e) = peripheral.cancel_connection() {
                debug!("Ignoring cancel failure for {}: {}", peripheral.device(), e);
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    devices: HashMap<DeviceUuid, DeviceRecord>,
    keys: HashMap<PublicKey, Vec<DeviceUuid>>,
    next_generation: u64,
}

impl Inner {
    fn unmap_key(&mut self, device: &DeviceUuid, key: &PublicKey) {
        if let Some(devices) = self.keys.get_mut(key) {
            devices.retain(|d| d != device);
            if devices.is_empty() {
                self.keys.remove(key);
            }
        }
    }

    fn remove_device(&mut self, device: &DeviceUuid) -> Option<DeviceRecord> {
        let record = self.devices.remove(device)?;
        if let Some(key) = &record.key {
            self.unmap_key(device, key);
        }
        Some(record)
    }
}

struct Shared {
    inner: Mutex<Inner>,
    clearing: AtomicBool,
    config: BleConfig,
}

// ----------------------------------------------------------------------------
// Tracker
// ----------------------------------------------------------------------------

/// Connection state tracker shared by the central and peripheral roles
#[derive(Clone)]
pub struct BleState {
    shared: Arc<Shared>,
}

impl BleState {
    pub fn new(config: BleConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                clearing: AtomicBool::new(false),
                config,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &BleConfig {
        &self.shared.config
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// True while a connection is in flight, a peer is attached or the device
    /// has resolved to a key.
    pub fn is_connecting_or_connected(&self, device: &DeviceUuid) -> bool {
        let connected = self.lock().devices.get(device).map_or(false, |record| {
            record.phase != DevicePhase::Discovered || record.peer.is_some() || record.key.is_some()
        });
        debug!("Is connecting or connected? {}: {}", device, connected);
        connected
    }

    pub fn is_connected_device(&self, device: &DeviceUuid) -> bool {
        self.lock()
            .devices
            .get(device)
            .map_or(false, |record| record.peer.is_some())
    }

    /// True if any device mapped to `key` holds a peer transport
    pub fn is_connected_key(&self, key: &PublicKey) -> bool {
        let inner = self.lock();
        inner.keys.get(key).map_or(false, |devices| {
            devices.iter().any(|device| {
                inner
                    .devices
                    .get(device)
                    .map_or(false, |record| record.peer.is_some())
            })
        })
    }

    /// Whether the device's registered key is carried by a live peer on any
    /// device, this one included.
    pub fn holds_live_key(&self, device: &DeviceUuid) -> bool {
        let inner = self.lock();
        let Some(key) = inner.devices.get(device).and_then(|record| record.key.as_ref()) else {
            return false;
        };
        inner.keys.get(key).map_or(false, |devices| {
            devices.iter().any(|d| {
                inner
                    .devices
                    .get(d)
                    .map_or(false, |record| record.peer.is_some())
            })
        })
    }

    pub fn phase(&self, device: &DeviceUuid) -> Option<DevicePhase> {
        self.lock().devices.get(device).map(|record| record.phase)
    }

    pub fn key_of(&self, device: &DeviceUuid) -> Option<PublicKey> {
        self.lock()
            .devices
            .get(device)
            .and_then(|record| record.key.clone())
    }

    pub fn devices_for_key(&self, key: &PublicKey) -> Vec<DeviceUuid> {
        self.lock().keys.get(key).cloned().unwrap_or_default()
    }

    pub fn has_timer(&self, device: &DeviceUuid) -> bool {
        self.lock()
            .devices
            .get(device)
            .map_or(false, |record| record.timer.is_some())
    }

    pub fn peripheral(&self, device: &DeviceUuid) -> Option<PeripheralRef> {
        self.lock()
            .devices
            .get(device)
            .and_then(|record| record.peripheral.clone())
    }

    pub fn has_peripheral(&self, device: &DeviceUuid) -> bool {
        self.lock()
            .devices
            .get(device)
            .map_or(false, |record| record.peripheral.is_some())
    }

    pub fn device_count(&self) -> usize {
        self.lock().devices.len()
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Map `device` to `key` once its handshake has been read.
    pub fn register_device(&self, device: &DeviceUuid, key: &PublicKey) {
        let mut inner = self.lock();
        let previous = inner
            .devices
            .entry(device.clone())
            .or_insert_with(|| DeviceRecord::new(DevicePhase::Discovered))
            .key
            .replace(key.clone());
        if let Some(previous) = previous.filter(|previous| previous != key) {
            inner.unmap_key(device, &previous);
        }

        let devices = inner.keys.entry(key.clone()).or_default();
        if !devices.contains(device) {
            devices.push(device.clone());
        }
        info!("Registered {} for key {}", device, key);
    }

    /// Start tracking a newly discovered peripheral and arm the connect timeout.
    pub fn add_found_peripheral(&self, device: &DeviceUuid, peripheral: PeripheralRef) {
        let mut released = Released::default();
        {
            let mut inner = self.lock();
            if let Some(old) = inner.remove_device(device) {
                released.take(old);
            }
            let mut record = DeviceRecord::new(DevicePhase::Connecting);
            record.peripheral = Some(peripheral);
            inner.devices.insert(device.clone(), record);
            self.arm_timer(&mut inner, device, self.shared.config.connect_timeout);
        }
        info!("Adding peripheral for {}", device);
        // the stale handle names the same OS peripheral we are connecting to
        released.peripherals.clear();
        released.shut_down();
    }

    /// Record the PSM of an outbound channel and re-arm the shorter timeout.
    /// Returns false if the device is no longer tracked.
    pub fn add_connecting_channel(&self, device: &DeviceUuid, psm: u16) -> bool {
        let mut inner = self.lock();
        match inner.devices.get_mut(device) {
            Some(record) => record.phase = DevicePhase::ChannelPending { psm },
            None => {
                debug!("Not tracking {}, dropping channel {}", device, psm);
                return false;
            }
        }
        self.arm_timer(&mut inner, device, self.shared.config.channel_timeout);
        info!("Adding connecting channel for {}: {}", device, psm);
        true
    }

    /// Attach a live transport; the device no longer needs a timeout.
    pub fn add_peer(&self, device: &DeviceUuid, peer: Arc<dyn PeerTransport>) {
        let replaced = {
            let mut inner = self.lock();
            let record = inner
                .devices
                .entry(device.clone())
                .or_insert_with(|| DeviceRecord::new(DevicePhase::Discovered));
            record.phase = DevicePhase::Peered;
            if let Some(timer) = record.timer.take() {
                timer.cancel();
            }
            let link = peer.link_id();
            record
                .peer
                .replace(peer)
                .filter(|old| old.link_id() != link)
        };
        info!("Adding peer for {}", device);

        if let Some(old) = replaced {
            debug!("Closing replaced peer {} for {}", old.link_id(), device);
            old.close();
        }
    }

    /// Cancel the device's timeout and leave everything else in place.
    pub fn stop_timer(&self, device: &DeviceUuid) {
        let timer = self
            .lock()
            .devices
            .get_mut(device)
            .and_then(|record| record.timer.take());
        if let Some(timer) = timer {
            debug!("Stopping timer for {}", device);
            timer.cancel();
        }
    }

    /// Drop the transient connection bookkeeping for a device whose key is
    /// already connected through another device. The key mapping stays, so a
    /// later rediscovery is ignored.
    pub fn clear_device_connecting_state(&self, device: &DeviceUuid) {
        let peripheral = {
            let mut inner = self.lock();
            let Some(record) = inner.devices.get_mut(device) else {
                return;
            };
            if let Some(timer) = record.timer.take() {
                timer.cancel();
            }
            if record.peer.is_none() {
                record.phase = DevicePhase::Discovered;
            }
            record.peripheral.take()
        };
        info!("Clearing connecting state for {}", device);

        if let Some(peripheral) = peripheral {
            if let Err(e) = peripheral.cancel_connection() {
                debug!("Ignoring cancel failure for {}: {}", device, e);
            }
        }
    }

    /// Full teardown of one device. Ignored while a full clear is running.
    pub fn clear_all_device_state(&self, device: &DeviceUuid) {
        if self.shared.clearing.load(Ordering::SeqCst) {
            debug!("Already clearing state, ignoring call for {}", device);
            return;
        }

        let mut released = Released::default();
        if let Some(record) = self.lock().remove_device(device) {
            released.take(record);
            info!("Clearing state for {}", device);
        }
        released.shut_down();
    }

    /// Tear down every device. A call made while another clear is running is
    /// a no-op.
    pub fn clear(&self) {
        if self.shared.clearing.swap(true, Ordering::SeqCst) {
            debug!("Clear already in progress");
            return;
        }

        let mut released = Released::default();
        {
            let mut inner = self.lock();
            for (_, record) in inner.devices.drain() {
                released.take(record);
            }
            inner.keys.clear();
        }
        info!(
            "Clearing all state ({} peers, {} peripherals)",
            released.peers.len(),
            released.peripherals.len()
        );
        released.shut_down();

        self.shared.clearing.store(false, Ordering::SeqCst);
    }

    /// Stop hook target for peer transports. Cleans up the device only if the
    /// stopped link is the one currently attached.
    pub fn peer_stopped(&self, device: &DeviceUuid, link: LinkId) {
        let current = self.lock().devices.get(device).map(|record| {
            record
                .peer
                .as_ref()
                .map_or(false, |peer| peer.link_id() == link)
        });
        match current {
            Some(true) => {
                info!("Peer {} for {} stopped", link, device);
                self.clear_all_device_state(device);
            }
            Some(false) => debug!("Ignoring stop of detached peer {} for {}", link, device),
            None => {}
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn arm_timer(&self, inner: &mut Inner, device: &DeviceUuid, timeout: Duration) {
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let Some(record) = inner.devices.get_mut(device) else {
            return;
        };

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let target = device.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                BleState { shared }.on_timeout(&target, generation);
            }
        });

        debug!("Restarting timer for {}", device);
        if let Some(old) = record.timer.replace(DeviceTimer { generation, handle }) {
            old.cancel();
        }
    }

    fn on_timeout(&self, device: &DeviceUuid, generation: u64) {
        let expired = {
            let mut inner = self.lock();
            match inner.devices.get_mut(device) {
                Some(record)
                    if record
                        .timer
                        .as_ref()
                        .map_or(false, |timer| timer.generation == generation) =>
                {
                    // drop without aborting: this is the running timer task
                    record.timer.take();
                    true
                }
                _ => false,
            }
        };

        if expired {
            warn!("Peripheral connection timed out {}", device);
            self.clear_all_device_state(device);
        } else {
            debug!("Timer stopped for {}", device);
        }
    }
}

impl std::fmt::Debug for BleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("BleState")
            .field("devices", &inner.devices.len())
            .field("keys", &inner.keys.len())
            .field("clearing", &self.shared.clearing.load(Ordering::SeqCst))
            .finish()
    }
}
