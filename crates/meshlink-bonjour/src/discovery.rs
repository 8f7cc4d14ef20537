//! Service announcement and browsing
//!
//! [`ServiceDiscovery`] is the seam between the session and the mDNS stack;
//! [`MdnsDiscovery`] implements it with `mdns-sd`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{BonjourError, Result};

/// Longest DNS label an instance name may occupy
pub const MAX_INSTANCE_LEN: usize = 63;

/// What a node announces about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service_type: String,
    pub instance: String,
    pub port: u16,
    pub txt: HashMap<String, String>,
}

impl ServiceRecord {
    pub fn new(service_type: impl Into<String>, instance: impl Into<String>, port: u16) -> Self {
        Self {
            service_type: service_type.into(),
            instance: instance.into(),
            port,
            txt: HashMap::new(),
        }
    }

    pub fn with_txt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.txt.insert(key.into(), value.into());
        self
    }

    /// Full DNS-SD name, `<instance>.<service type>`
    /// Reject instance names that cannot be encoded as a single DNS label.
    pub fn check_instance(&self) -> Result<()> {
        if self.instance.is_empty() || self.instance.len() > MAX_INSTANCE_LEN {
            return Err(BonjourError::RegistrationFailed {
                instance: self.instance.clone(),
                reason: format!(
                    "instance label is {} bytes, must be 1 to {}",
                    self.instance.len(),
                    MAX_INSTANCE_LEN
                ),
            });
        }
        Ok(())
    }

    pub fn fullname(&self) -> String {
        format!("{}.{}", self.instance, self.service_type)
    }
}

/// A resolved remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseResult {
    pub endpoint: Endpoint,
    /// TXT record entries
    pub txt: HashMap<String, String>,
    pub addrs: Vec<SocketAddr>,
}

impl BrowseResult {
    pub fn txt_value(&self, key: &str) -> Option<&str> {
        self.txt.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Resolved(BrowseResult),
    Removed(Endpoint),
}

pub trait ServiceDiscovery: Send + Sync {
    fn register(&self, record: &ServiceRecord) -> Result<()>;

    fn unregister(&self, record: &ServiceRecord) -> Result<()>;

    /// Start browsing `service_type`. Events arrive until `stop_browse`.
    fn browse(&self, service_type: &str) -> Result<mpsc::UnboundedReceiver<BrowseEvent>>;

    fn stop_browse(&self, service_type: &str) -> Result<()>;
}

// ----------------------------------------------------------------------------
// mDNS
// ----------------------------------------------------------------------------

pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    registered: Mutex<Vec<String>>,
}

impl MdnsDiscovery {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| BonjourError::Daemon(format!("Failed to create mDNS daemon: {}", e)))?;
        Ok(Self {
            daemon,
            registered: Mutex::new(Vec::new()),
        })
    }

    fn host_name(record: &ServiceRecord) -> String {
        let label: String = record.instance.chars().take(16).collect();
        format!("meshlink-{}.local.", label)
    }

    fn translate(event: ServiceEvent) -> Option<BrowseEvent> {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let port = info.get_port();
                let addrs = info
                    .get_addresses()
                    .iter()
                    .map(|ip| SocketAddr::new((*ip).into(), port))
                    .collect();
                let txt = info
                    .get_properties()
                    .iter()
                    .map(|property| (property.key().to_string(), property.val_str().to_string()))
                    .collect();
                Some(BrowseEvent::Resolved(BrowseResult {
                    endpoint: Endpoint::service(info.get_fullname()),
                    txt,
                    addrs,
                }))
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                Some(BrowseEvent::Removed(Endpoint::service(fullname)))
            }
            other => {
                debug!("Unhandled mDNS event: {:?}", other);
                None
            }
        }
    }
}

impl ServiceDiscovery for MdnsDiscovery {
    fn register(&self, record: &ServiceRecord) -> Result<()> {
        // the daemon thread does not survive an oversized label
        record.check_instance()?;
        let info = ServiceInfo::new(
            &record.service_type,
            &record.instance,
            &Self::host_name(record),
            "",
            record.port,
            Some(record.txt.clone()),
        )
        .map_err(|e| BonjourError::RegistrationFailed {
            instance: record.instance.clone(),
            reason: e.to_string(),
        })?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| BonjourError::RegistrationFailed {
                instance: record.instance.clone(),
                reason: e.to_string(),
            })?;
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fullname.clone());
        info!("Announced {} on port {}", fullname, record.port);
        Ok(())
    }

    fn unregister(&self, record: &ServiceRecord) -> Result<()> {
        let fullname = record.fullname();
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|name| name != &fullname);
        self.daemon.unregister(&fullname)?;
        info!("Withdrew {}", fullname);
        Ok(())
    }

    fn browse(&self, service_type: &str) -> Result<mpsc::UnboundedReceiver<BrowseEvent>> {
        let receiver = self
            .daemon
            .browse(service_type)
            .map_err(|e| BonjourError::BrowseFailed {
                service_type: service_type.to_string(),
                reason: e.to_string(),
            })?;
        let (tx, rx) = mpsc::unbounded_channel();

        let browsed = service_type.to_string();
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                if let Some(event) = Self::translate(event) {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            debug!("Stopped browsing {}", browsed);
        });

        info!("Browsing for {}", service_type);
        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str) -> Result<()> {
        self.daemon.stop_browse(service_type)?;
        Ok(())
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        let registered = std::mem::take(
            self.registered
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for fullname in registered {
            if let Err(e) = self.daemon.unregister(&fullname) {
                debug!("Ignoring unregister failure for {}: {}", fullname, e);
            }
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!("Failed to shut down mDNS daemon: {}", e);
        }
    }
}
