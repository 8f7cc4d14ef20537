//! Boundary to the embedded overlay-routing engine
//!
//! The engine is a foreign module: meshlink never routes frames itself. It
//! asks the engine for one [`Conduit`] per physical peer connection and copies
//! bytes between that conduit and the transport socket. Conduit reads and
//! writes may block, so callers must keep them off async executor threads
//! (see [`crate::link`]).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::types::{PeerType, PublicKey};

/// Largest frame the engine ever hands out or accepts; sizes every read buffer.
pub const MAX_FRAME_SIZE: usize = 65535;

// ----------------------------------------------------------------------------
// Engine Traits
// ----------------------------------------------------------------------------

/// A logical port on the routing switch, one per active peer connection
pub trait Conduit: Send + Sync + fmt::Debug {
    /// Push bytes received from the peer into the switch. May block on backpressure.
    fn write(&self, bytes: &[u8]) -> Result<usize, EngineError>;

    /// Wait for the next outbound frame. Blocks until data is available or the
    /// conduit is closed.
    fn read_copy(&self) -> Result<Vec<u8>, EngineError>;

    /// Release the port. Unblocks pending reads.
    fn close(&self) -> Result<(), EngineError>;
}

/// Which peers to include in a peer count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFilter {
    All,
    Only(PeerType),
}

/// The routing engine surface consumed by the bridge
pub trait RoutingEngine: Send + Sync {
    fn start(&self) -> Result<(), EngineError>;
    fn stop(&self);

    fn public_key(&self) -> PublicKey;
    fn base_url(&self) -> Option<String>;

    /// Allocate a conduit tagged with a zone label and transport type
    fn conduit(&self, zone: &str, peer_type: PeerType) -> Result<Arc<dyn Conduit>, EngineError>;

    fn peer_count(&self, filter: PeerFilter) -> usize;
    fn disconnect_type(&self, peer_type: PeerType);

    fn set_multicast_enabled(&self, enabled: bool);
    fn set_relaying_enabled(&self, enabled: bool);
    fn set_static_peer(&self, uri: &str);
    fn set_relay_servers(&self, key: &str, uris: &str);
    fn relay_servers(&self, key: &str) -> String;

    fn max_frame_size(&self) -> usize {
        MAX_FRAME_SIZE
    }
}

// ----------------------------------------------------------------------------
// Engine Construction
// ----------------------------------------------------------------------------

/// Persistent storage locations handed to a freshly created engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnginePaths {
    pub storage_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl EnginePaths {
    pub fn new(storage_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

/// Creates engine instances; the service calls it once per `start()`
pub trait EngineBuilder: Send + Sync {
    fn build(&self, paths: &EnginePaths) -> Result<Arc<dyn RoutingEngine>, EngineError>;
}

impl<F> EngineBuilder for F
where
    F: Fn(&EnginePaths) -> Result<Arc<dyn RoutingEngine>, EngineError> + Send + Sync,
{
    fn build(&self, paths: &EnginePaths) -> Result<Arc<dyn RoutingEngine>, EngineError> {
        self(paths)
    }
}
