//! Channel-driven fake Bluetooth stack
//!
//! Commands issued by the roles are recorded; tests answer them by pushing
//! events through the senders in [`FakeStack`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use meshlink_core::DeviceUuid;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{BleError, Result};
use crate::platform::{
    BleCentral, BlePeripheralManager, BlePlatform, CentralEvent, PeripheralEvent, PeripheralLink,
    RadioState,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Peripheral
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralCommand {
    Connect,
    DiscoverHandshake,
    ReadHandshake,
    OpenChannel(u16),
}

#[derive(Debug)]
pub struct FakePeripheral {
    device: DeviceUuid,
    commands: Mutex<Vec<PeripheralCommand>>,
    cancels: AtomicUsize,
    powered: AtomicBool,
}

impl FakePeripheral {
    pub fn new(device: impl Into<DeviceUuid>) -> Arc<Self> {
        Arc::new(Self {
            device: device.into(),
            commands: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            powered: AtomicBool::new(true),
        })
    }

    pub fn commands(&self) -> Vec<PeripheralCommand> {
        lock(&self.commands).clone()
    }

    pub fn opened_channel(&self) -> bool {
        self.commands()
            .iter()
            .any(|c| matches!(c, PeripheralCommand::OpenChannel(_)))
    }

    /// Cancellation attempts, successful or not
    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Make cancellation fail as it does with the radio off
    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    fn record(&self, command: PeripheralCommand) {
        lock(&self.commands).push(command);
    }
}

impl PeripheralLink for FakePeripheral {
    fn device(&self) -> DeviceUuid {
        self.device.clone()
    }

    fn connect(&self) {
        self.record(PeripheralCommand::Connect);
    }

    fn discover_handshake(&self) {
        self.record(PeripheralCommand::DiscoverHandshake);
    }

    fn read_handshake(&self) {
        self.record(PeripheralCommand::ReadHandshake);
    }

    fn open_channel(&self, psm: u16) {
        self.record(PeripheralCommand::OpenChannel(psm));
    }

    fn cancel_connection(&self) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.powered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BleError::NotPoweredOn)
        }
    }
}

// ----------------------------------------------------------------------------
// Managers
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct FakeCentral {
    radio: Mutex<RadioState>,
    scanning: AtomicBool,
    scans_started: AtomicUsize,
}

impl FakeCentral {
    pub fn new(radio: RadioState) -> Arc<Self> {
        Arc::new(Self {
            radio: Mutex::new(radio),
            scanning: AtomicBool::new(false),
            scans_started: AtomicUsize::new(0),
        })
    }

    pub fn set_radio_state(&self, radio: RadioState) {
        *lock(&self.radio) = radio;
    }

    pub fn scans_started(&self) -> usize {
        self.scans_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleCentral for FakeCentral {
    fn radio_state(&self) -> RadioState {
        *lock(&self.radio)
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    async fn start_scan(&self, _service: Uuid) -> Result<()> {
        self.scanning.store(true, Ordering::SeqCst);
        self.scans_started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakePeripheralManager {
    radio: Mutex<RadioState>,
    publishes: AtomicUsize,
    services: Mutex<Vec<Vec<u8>>>,
    advertising: AtomicBool,
    removals: AtomicUsize,
}

impl FakePeripheralManager {
    pub fn new(radio: RadioState) -> Arc<Self> {
        Arc::new(Self {
            radio: Mutex::new(radio),
            publishes: AtomicUsize::new(0),
            services: Mutex::new(Vec::new()),
            advertising: AtomicBool::new(false),
            removals: AtomicUsize::new(0),
        })
    }

    pub fn set_radio_state(&self, radio: RadioState) {
        *lock(&self.radio) = radio;
    }

    pub fn publishes(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    /// Handshake values handed to `set_service`, oldest first
    pub fn services(&self) -> Vec<Vec<u8>> {
        lock(&self.services).clone()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlePeripheralManager for FakePeripheralManager {
    fn radio_state(&self) -> RadioState {
        *lock(&self.radio)
    }

    fn publish_channel(&self) {
        self.publishes.fetch_add(1, Ordering::SeqCst);
    }

    fn set_service(&self, handshake: Vec<u8>) {
        lock(&self.services).push(handshake);
    }

    async fn start_advertising(&self) -> Result<()> {
        self.advertising.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        self.advertising.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_all_services(&self) -> Result<()> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        lock(&self.services).clear();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Stack
// ----------------------------------------------------------------------------

/// Test-side handles of a fake platform
#[derive(Clone)]
pub struct FakeStack {
    pub central: Arc<FakeCentral>,
    pub peripheral: Arc<FakePeripheralManager>,
    pub central_tx: mpsc::UnboundedSender<CentralEvent>,
    pub peripheral_tx: mpsc::UnboundedSender<PeripheralEvent>,
}

impl FakeStack {
    /// A fake platform with both radios in `radio`
    pub fn new(radio: RadioState) -> (Self, BlePlatform) {
        let central = FakeCentral::new(radio);
        let peripheral = FakePeripheralManager::new(radio);
        let (central_tx, central_events) = mpsc::unbounded_channel();
        let (peripheral_tx, peripheral_events) = mpsc::unbounded_channel();

        let platform = BlePlatform {
            central: central.clone(),
            central_events,
            peripheral: peripheral.clone(),
            peripheral_events,
        };
        let stack = Self {
            central,
            peripheral,
            central_tx,
            peripheral_tx,
        };
        (stack, platform)
    }

    pub fn central_event(&self, event: CentralEvent) {
        let _ = self.central_tx.send(event);
    }

    pub fn peripheral_event(&self, event: PeripheralEvent) {
        let _ = self.peripheral_tx.send(event);
    }
}
