//! Builder for [`MeshService`]

use std::sync::Arc;

use meshlink_ble::BlePlatform;
use meshlink_bonjour::ServiceDiscovery;
use meshlink_core::{EngineBuilder, EnginePaths, MeshConfig, MeshError, MeshSettings, Result};
use tracing::info;

use crate::ble_session::SharedPlatform;
use crate::service::MeshService;

pub struct MeshServiceBuilder {
    config: MeshConfig,
    settings: MeshSettings,
    paths: Option<EnginePaths>,
    engine_builder: Option<Arc<dyn EngineBuilder>>,
    ble_platform: Option<BlePlatform>,
    system_bluetooth: bool,
    discovery: Option<Arc<dyn ServiceDiscovery>>,
}

impl Default for MeshServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshServiceBuilder {
    pub fn new() -> Self {
        Self {
            config: MeshConfig::default(),
            settings: MeshSettings::default(),
            paths: None,
            engine_builder: None,
            ble_platform: None,
            system_bluetooth: true,
            discovery: None,
        }
    }

    pub fn with_config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    /// Persisted toggles applied on every `start()`
    pub fn with_settings(mut self, settings: MeshSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_paths(mut self, paths: EnginePaths) -> Self {
        self.paths = Some(paths);
        self
    }

    pub fn with_engine_builder(mut self, builder: Arc<dyn EngineBuilder>) -> Self {
        self.engine_builder = Some(builder);
        self
    }

    /// Use this Bluetooth stack instead of opening the host's
    pub fn with_ble_platform(mut self, platform: BlePlatform) -> Self {
        self.ble_platform = Some(platform);
        self
    }

    /// Whether to open the host Bluetooth stack when no platform was given
    pub fn with_system_bluetooth(mut self, enabled: bool) -> Self {
        self.system_bluetooth = enabled;
        self
    }

    /// Use this discovery backend instead of mDNS
    pub fn with_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn build(self) -> Result<MeshService> {
        self.config.validate()?;
        let engine_builder = self
            .engine_builder
            .ok_or_else(|| MeshError::Configuration("no routing engine configured".into()))?;
        let paths = self.paths.unwrap_or_else(|| {
            let base = std::env::temp_dir().join("meshlink");
            EnginePaths::new(base.join("storage"), base.join("cache"))
        });
        info!("Building mesh service");

        Ok(MeshService::new(
            self.config,
            self.settings,
            paths,
            engine_builder,
            self.ble_platform.map(SharedPlatform::from),
            self.system_bluetooth,
            self.discovery,
        ))
    }
}
