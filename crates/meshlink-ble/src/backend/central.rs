//! Central role on top of btleplug
//!
//! Scanning, connecting and the handshake read go through btleplug. btleplug
//! has no L2CAP support, so outbound channels are opened with BlueZ sockets on
//! Linux and reported as unsupported elsewhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent as AdapterEvent, CentralState, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use meshlink_core::DeviceUuid;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BleError, Result};
use crate::platform::{BleCentral, BleChannel, CentralEvent, PeripheralLink, RadioState};
use crate::protocol::{HANDSHAKE_CHARACTERISTIC_UUID, MESH_SERVICE_UUID};

fn device_of(address: BDAddr) -> DeviceUuid {
    DeviceUuid::new(address.to_string())
}

fn radio_state_of(state: &CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        CentralState::Unknown => RadioState::Unknown,
    }
}

// ----------------------------------------------------------------------------
// Central Manager
// ----------------------------------------------------------------------------

pub struct BtleplugCentral {
    adapter: Adapter,
    powered: Arc<AtomicBool>,
    scanning: AtomicBool,
}

impl BtleplugCentral {
    /// Open the first adapter and forward its events to `events`.
    pub async fn start(events: mpsc::UnboundedSender<CentralEvent>) -> Result<Arc<Self>> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BleError::AdapterNotAvailable)?;

        let initial = match adapter.adapter_state().await {
            Ok(state) => radio_state_of(&state),
            Err(e) => {
                debug!("Adapter state unavailable, assuming powered on: {}", e);
                RadioState::PoweredOn
            }
        };
        let powered = Arc::new(AtomicBool::new(initial.is_powered_on()));
        let mut adapter_events = adapter.events().await?;
        let event_adapter = adapter.clone();
        let event_powered = powered.clone();

        tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                let id = match event {
                    AdapterEvent::DeviceDiscovered(id) | AdapterEvent::DeviceUpdated(id) => id,
                    AdapterEvent::StateUpdate(state) => {
                        let radio = radio_state_of(&state);
                        info!("Adapter state changed to {:?}", radio);
                        event_powered.store(radio.is_powered_on(), Ordering::SeqCst);
                        if events.send(CentralEvent::StateChanged(radio)).is_err() {
                            break;
                        }
                        continue;
                    }
                    AdapterEvent::DeviceDisconnected(id) => {
                        if let Ok(peripheral) = event_adapter.peripheral(&id).await {
                            let device = device_of(peripheral.address());
                            let _ = events.send(CentralEvent::Disconnected(device));
                        }
                        continue;
                    }
                    _ => continue,
                };

                let Ok(peripheral) = event_adapter.peripheral(&id).await else {
                    continue;
                };
                let link = BtleplugPeripheral::new(peripheral, event_powered.clone(), events.clone());
                if events.send(CentralEvent::Discovered(link)).is_err() {
                    break;
                }
            }
            debug!("Adapter event stream ended");
        });

        info!("BLE central adapter initialized");
        Ok(Arc::new(Self {
            adapter,
            powered,
            scanning: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    fn radio_state(&self) -> RadioState {
        if self.powered.load(Ordering::SeqCst) {
            RadioState::PoweredOn
        } else {
            RadioState::PoweredOff
        }
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    async fn start_scan(&self, service: Uuid) -> Result<()> {
        let filter = ScanFilter {
            services: vec![service],
        };
        if let Err(e) = self.adapter.start_scan(filter).await {
            self.powered.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        self.adapter.stop_scan().await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Remote Peripheral
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct BtleplugPeripheral {
    peripheral: Peripheral,
    device: DeviceUuid,
    powered: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<CentralEvent>,
}

impl BtleplugPeripheral {
    fn new(
        peripheral: Peripheral,
        powered: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<CentralEvent>,
    ) -> Arc<Self> {
        let device = device_of(peripheral.address());
        Arc::new(Self {
            peripheral,
            device,
            powered,
            events,
        })
    }

    fn send(&self, event: CentralEvent) {
        if self.events.send(event).is_err() {
            debug!("Central event channel closed, dropping event for {}", self.device);
        }
    }
}

impl PeripheralLink for BtleplugPeripheral {
    fn device(&self) -> DeviceUuid {
        self.device.clone()
    }

    fn connect(&self) {
        let peripheral = self.peripheral.clone();
        let device = self.device.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => CentralEvent::Connected(device),
                Err(e) => CentralEvent::FailedToConnect {
                    device,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
    }

    fn discover_handshake(&self) {
        let peripheral = self.peripheral.clone();
        let device = self.device.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => {
                    let found = peripheral.characteristics().iter().any(|c| {
                        c.uuid == HANDSHAKE_CHARACTERISTIC_UUID && c.service_uuid == MESH_SERVICE_UUID
                    });
                    if found {
                        Ok(())
                    } else {
                        Err(BleError::CharacteristicNotFound {
                            device: device.to_string(),
                        })
                    }
                }
                Err(e) => Err(BleError::ServiceNotFound {
                    device: format!("{} ({})", device, e),
                }),
            };
            let _ = events.send(CentralEvent::HandshakeDiscovered { device, result });
        });
    }

    fn read_handshake(&self) {
        let peripheral = self.peripheral.clone();
        let device = self.device.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let characteristic = peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == HANDSHAKE_CHARACTERISTIC_UUID);
            let result = match characteristic {
                Some(characteristic) => peripheral
                    .read(&characteristic)
                    .await
                    .map_err(|e| BleError::ReadFailed(e.to_string())),
                None => Err(BleError::CharacteristicNotFound {
                    device: device.to_string(),
                }),
            };
            let _ = events.send(CentralEvent::HandshakeRead { device, result });
        });
    }

    fn open_channel(&self, psm: u16) {
        let address = self.peripheral.address().into_inner();
        let device = self.device.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = connect_l2cap(address, psm)
                .await
                .map(|stream| BleChannel::new(device.clone(), stream));
            let _ = events.send(CentralEvent::ChannelOpened { device, result });
        });
    }

    fn cancel_connection(&self) -> Result<()> {
        if !self.powered.load(Ordering::SeqCst) {
            return Err(BleError::NotPoweredOn);
        }
        let peripheral = self.peripheral.clone();
        let device = self.device.clone();
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect {}: {}", device, e);
            }
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// L2CAP Sockets
// ----------------------------------------------------------------------------

#[cfg(target_os = "linux")]
async fn connect_l2cap(address: [u8; 6], psm: u16) -> Result<bluer::l2cap::Stream> {
    use bluer::l2cap::{SocketAddr, Stream};
    use bluer::{Address, AddressType};

    let target = SocketAddr::new(Address(address), AddressType::LePublic, psm);
    Stream::connect(target)
        .await
        .map_err(|e| BleError::ChannelFailed(e.to_string()))
}

#[cfg(not(target_os = "linux"))]
async fn connect_l2cap(_address: [u8; 6], _psm: u16) -> Result<tokio::io::DuplexStream> {
    Err(BleError::Unsupported("L2CAP channels"))
}
