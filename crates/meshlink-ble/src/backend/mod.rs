//! Platform backends
//!
//! - Linux: btleplug central role plus a BlueZ peripheral role, with L2CAP
//!   channels on BlueZ sockets
//! - Other platforms: btleplug central role only; the peripheral role reports
//!   itself unsupported

pub mod central;

#[cfg(target_os = "linux")]
pub mod bluez;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::error::Result;
use crate::platform::{BlePlatform, UnsupportedPeripheral};

pub use central::{BtleplugCentral, BtleplugPeripheral};

#[cfg(target_os = "linux")]
pub use bluez::BluezPeripheral;

/// Open the host's Bluetooth stack in both roles.
pub async fn open_platform() -> Result<BlePlatform> {
    let (central_tx, central_events) = mpsc::unbounded_channel();
    let central = BtleplugCentral::start(central_tx).await?;

    let (peripheral_tx, peripheral_events) = mpsc::unbounded_channel();

    #[cfg(target_os = "linux")]
    let peripheral: Arc<dyn crate::platform::BlePeripheralManager> =
        match BluezPeripheral::start(peripheral_tx).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                tracing::warn!("Peripheral role unavailable: {}", e);
                Arc::new(UnsupportedPeripheral)
            }
        };

    #[cfg(not(target_os = "linux"))]
    let peripheral: Arc<dyn crate::platform::BlePeripheralManager> = {
        drop(peripheral_tx);
        Arc::new(UnsupportedPeripheral)
    };

    info!("Bluetooth platform ready");
    Ok(BlePlatform {
        central,
        central_events,
        peripheral,
        peripheral_events,
    })
}
