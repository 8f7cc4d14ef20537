//! Command execution

use std::sync::Arc;

use meshlink_core::MemoryEngineBuilder;
use meshlink_runtime::{MeshService, MeshServiceBuilder};
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::error::Result;

/// Build the mesh service for `config` on top of the in-process engine
pub fn build_service(config: &NodeConfig) -> Result<MeshService> {
    let mut engines = MemoryEngineBuilder::new().with_capture(false);
    if let Some(key) = &config.node.public_key {
        engines = engines.with_public_key(key.as_str());
    }

    let paths = config.paths();
    std::fs::create_dir_all(paths.storage_dir())?;
    std::fs::create_dir_all(paths.cache_dir())?;

    let service = MeshServiceBuilder::new()
        .with_config(config.mesh.clone())
        .with_settings(config.settings.clone())
        .with_paths(paths)
        .with_engine_builder(Arc::new(engines))
        .build()?;
    Ok(service)
}

/// Run a node, logging the peer summary until Ctrl-C
pub async fn run(config: NodeConfig) -> Result<()> {
    let service = build_service(&config)?;
    service.start().await?;

    if let Some(key) = service.public_key().await {
        info!("Node {} is running", key);
    }
    if let Some(addr) = service.bonjour_addr().await {
        info!("Accepting local network peers on {}", addr);
    }
    if !service.is_bluetooth_enabled().await && !config.settings.bluetooth_disabled {
        warn!("Bluetooth was requested but no adapter is available");
    }

    let mut status = tokio::time::interval(config.node.status_interval());
    loop {
        tokio::select! {
            _ = status.tick() => info!("{}", service.peers().await),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    info!("Shutting down");
    service.stop().await;
    Ok(())
}

/// Print an example configuration file to stdout
pub fn print_config() -> Result<()> {
    print!("{}", NodeConfig::example_config()?);
    Ok(())
}
