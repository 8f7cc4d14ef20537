//! One enabled period of the Bluetooth transport
//!
//! Enabling Bluetooth creates a fresh tracker and two role tasks, one per
//! event source, so central and peripheral transitions are each handled in
//! order. The platform's event receivers outlive sessions and are handed from
//! one session to the next.

use std::future::Future;
use std::sync::Arc;

use meshlink_ble::state::BleState;
use meshlink_ble::{
    BleCentral, BlePeripheralManager, BlePlatform, CentralEvent, CentralRole, PeripheralEvent,
    PeripheralRole,
};
use meshlink_core::{BleConfig, PeerType, RoutingEngine};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Platform handles shared by successive sessions
#[derive(Clone)]
pub(crate) struct SharedPlatform {
    central: Arc<dyn BleCentral>,
    central_events: Arc<Mutex<mpsc::UnboundedReceiver<CentralEvent>>>,
    peripheral: Arc<dyn BlePeripheralManager>,
    peripheral_events: Arc<Mutex<mpsc::UnboundedReceiver<PeripheralEvent>>>,
}

impl From<BlePlatform> for SharedPlatform {
    fn from(platform: BlePlatform) -> Self {
        Self {
            central: platform.central,
            central_events: Arc::new(Mutex::new(platform.central_events)),
            peripheral: platform.peripheral,
            peripheral_events: Arc::new(Mutex::new(platform.peripheral_events)),
        }
    }
}

fn stop_signal(mut rx: watch::Receiver<bool>) -> impl Future<Output = ()> {
    async move {
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

fn drain<T>(events: &mut mpsc::UnboundedReceiver<T>) -> usize {
    let mut dropped = 0;
    while events.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

pub struct BleSession {
    state: BleState,
    platform: SharedPlatform,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BleSession {
    pub(crate) fn start(
        platform: &SharedPlatform,
        engine: Arc<dyn RoutingEngine>,
        config: &BleConfig,
        max_frame_size: usize,
    ) -> Self {
        let state = BleState::new(config.clone());
        let (shutdown, _) = watch::channel(false);

        let central = CentralRole::new(
            state.clone(),
            platform.central.clone(),
            engine.clone(),
            max_frame_size,
        );
        let central_events = platform.central_events.clone();
        let central_stop = stop_signal(shutdown.subscribe());
        let central_task = tokio::spawn(async move {
            let mut events = central_events.lock().await;
            let dropped = drain(&mut *events);
            if dropped > 0 {
                debug!("Dropped {} central events queued while disabled", dropped);
            }
            central.run(&mut *events, central_stop).await;
        });

        let peripheral = PeripheralRole::new(
            state.clone(),
            platform.peripheral.clone(),
            engine,
            max_frame_size,
        );
        let peripheral_events = platform.peripheral_events.clone();
        let peripheral_stop = stop_signal(shutdown.subscribe());
        let peripheral_task = tokio::spawn(async move {
            let mut events = peripheral_events.lock().await;
            let dropped = drain(&mut *events);
            if dropped > 0 {
                debug!("Dropped {} peripheral events queued while disabled", dropped);
            }
            peripheral.run(&mut *events, peripheral_stop).await;
        });

        info!("Bluetooth enabled");
        Self {
            state,
            platform: platform.clone(),
            shutdown,
            tasks: vec![central_task, peripheral_task],
        }
    }

    /// Tracker of this session
    pub fn state(&self) -> &BleState {
        &self.state
    }

    /// Stop both roles, withdraw from the radio and drop every BLE peer.
    pub(crate) async fn stop(mut self, engine: &dyn RoutingEngine) {
        self.shutdown.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Bluetooth role task failed: {}", e);
            }
        }

        if let Err(e) = self.platform.central.stop_scan().await {
            debug!("Ignoring stop scan failure: {}", e);
        }
        if let Err(e) = self.platform.peripheral.stop_advertising().await {
            debug!("Ignoring stop advertising failure: {}", e);
        }
        if let Err(e) = self.platform.peripheral.remove_all_services().await {
            debug!("Ignoring remove services failure: {}", e);
        }

        self.state.clear();
        engine.disconnect_type(PeerType::Bluetooth);
        info!("Bluetooth disabled");
    }
}

impl Drop for BleSession {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
