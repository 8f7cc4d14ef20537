//! Peripheral role on top of BlueZ: L2CAP listener, GATT handshake service
//! and advertising

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicRead, CharacteristicReadRequest,
    Service,
};
use bluer::l2cap::{SocketAddr, StreamListener};
use bluer::{Adapter, AddressType, Session};
use meshlink_core::DeviceUuid;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BleError, Result};
use crate::platform::{BleChannel, BlePeripheralManager, PeripheralEvent, RadioState};
use crate::protocol::{HANDSHAKE_CHARACTERISTIC_UUID, MESH_SERVICE_UUID};

const LOCAL_NAME: &str = "meshlink";

#[derive(Default)]
struct Handles {
    application: Option<ApplicationHandle>,
    advertisement: Option<AdvertisementHandle>,
    listener: Option<JoinHandle<()>>,
}

struct Inner {
    adapter: Adapter,
    events: mpsc::UnboundedSender<PeripheralEvent>,
    handles: Mutex<Handles>,
}

impl Inner {
    fn handles(&self) -> MutexGuard<'_, Handles> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, event: PeripheralEvent) {
        if self.events.send(event).is_err() {
            debug!("Peripheral event channel closed");
        }
    }

    async fn listen(self: Arc<Self>) {
        let bound = async {
            let address = self.adapter.address().await?;
            let listener =
                StreamListener::bind(SocketAddr::new(address, AddressType::LePublic, 0)).await?;
            let psm = listener.as_ref().local_addr()?.psm;
            Ok::<_, BleError>((listener, psm))
        };

        let listener = match bound.await {
            Ok((listener, psm)) => {
                self.send(PeripheralEvent::ChannelPublished(Ok(psm)));
                listener
            }
            Err(e) => {
                self.send(PeripheralEvent::ChannelPublished(Err(BleError::PublishFailed(
                    e.to_string(),
                ))));
                return;
            }
        };

        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let device = DeviceUuid::new(remote.addr.to_string());
                    debug!("Accepted L2CAP channel from {}", device);
                    self.send(PeripheralEvent::InboundChannel {
                        device: device.clone(),
                        result: Ok(BleChannel::new(device, stream)),
                    });
                }
                Err(e) => {
                    warn!("L2CAP accept failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// BlueZ peripheral manager
pub struct BluezPeripheral {
    _session: Session,
    inner: Arc<Inner>,
}

impl BluezPeripheral {
    pub async fn start(events: mpsc::UnboundedSender<PeripheralEvent>) -> Result<Arc<Self>> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        if !adapter.is_powered().await.unwrap_or(false) {
            adapter
                .set_powered(true)
                .await
                .map_err(|e| BleError::AdvertisingFailed(e.to_string()))?;
        }
        info!("BlueZ peripheral adapter {} initialized", adapter.name());

        Ok(Arc::new(Self {
            _session: session,
            inner: Arc::new(Inner {
                adapter,
                events,
                handles: Mutex::new(Handles::default()),
            }),
        }))
    }
}

#[async_trait]
impl BlePeripheralManager for BluezPeripheral {
    fn radio_state(&self) -> RadioState {
        // the adapter is powered on during start
        RadioState::PoweredOn
    }

    fn publish_channel(&self) {
        let task = tokio::spawn(self.inner.clone().listen());
        if let Some(old) = self.inner.handles().listener.replace(task) {
            old.abort();
        }
    }

    fn set_service(&self, handshake: Vec<u8>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            // drop the previous registration before serving the new value
            inner.handles().application.take();

            let read = CharacteristicRead {
                read: true,
                fun: Box::new(move |_req: CharacteristicReadRequest| {
                    let value = handshake.clone();
                    Box::pin(async move { Ok(value) })
                }),
                ..Default::default()
            };
            let application = Application {
                services: vec![Service {
                    uuid: MESH_SERVICE_UUID,
                    primary: true,
                    characteristics: vec![Characteristic {
                        uuid: HANDSHAKE_CHARACTERISTIC_UUID,
                        read: Some(read),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            };

            let result = match inner.adapter.serve_gatt_application(application).await {
                Ok(handle) => {
                    inner.handles().application = Some(handle);
                    Ok(())
                }
                Err(e) => Err(BleError::ServiceFailed(e.to_string())),
            };
            inner.send(PeripheralEvent::ServiceAdded(result));
        });
    }

    async fn start_advertising(&self) -> Result<()> {
        let advertisement = Advertisement {
            advertisement_type: AdvertisementType::Peripheral,
            service_uuids: vec![MESH_SERVICE_UUID].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(LOCAL_NAME.to_string()),
            ..Default::default()
        };
        let handle = self
            .inner
            .adapter
            .advertise(advertisement)
            .await
            .map_err(|e| BleError::AdvertisingFailed(e.to_string()))?;
        self.inner.handles().advertisement = Some(handle);
        info!("Advertising mesh service");
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        if self.inner.handles().advertisement.take().is_some() {
            debug!("Stopped advertising");
        }
        Ok(())
    }

    async fn remove_all_services(&self) -> Result<()> {
        let mut handles = self.inner.handles();
        handles.application.take();
        if let Some(listener) = handles.listener.take() {
            listener.abort();
        }
        Ok(())
    }
}
