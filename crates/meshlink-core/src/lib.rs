//! Core building blocks for the meshlink peer bridge
//!
//! meshlink connects an embedded overlay-routing engine to nearby devices over
//! Bluetooth LE L2CAP channels and local-network sockets. This crate holds the
//! pieces every transport shares:
//!
//! - [`types`] - device and key identities, peer types, link ids
//! - [`errors`] - the error taxonomy used across the workspace
//! - [`engine`] - the boundary to the routing engine and its conduits
//! - [`memory`] - an in-process engine used by tests and the demo node
//! - [`link`] - open/close bookkeeping and conduit pumping shared by transports
//! - [`config`] - tunables and persisted user settings

pub mod config;
pub mod engine;
pub mod errors;
pub mod link;
pub mod memory;
pub mod types;

pub use config::{BleConfig, BonjourConfig, EngineConfig, MeshConfig, MeshSettings};
pub use engine::{Conduit, EngineBuilder, EnginePaths, PeerFilter, RoutingEngine, MAX_FRAME_SIZE};
pub use errors::{EngineError, MeshError, Result, TransportError};
pub use link::{LinkCore, PeerTransport, StopHook};
pub use memory::{MemoryConduit, MemoryEngine, MemoryEngineBuilder};
pub use types::{DeviceUuid, LinkId, PeerType, PublicKey};
