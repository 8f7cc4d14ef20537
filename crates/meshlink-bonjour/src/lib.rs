//! Local-network transport for the meshlink peer bridge
//!
//! Each node listens on a TCP port and announces it over mDNS under the
//! `_pinecone._tcp` service type, with its routing public key in the TXT
//! record. Browsing nodes dial every announced service whose key is not their
//! own. Both inbound and outbound sockets become [`NetworkPeer`]s bridged to
//! one routing-engine conduit each.

pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod peer;
pub mod session;

pub use discovery::{
    BrowseEvent, BrowseResult, MdnsDiscovery, ServiceDiscovery, ServiceRecord, MAX_INSTANCE_LEN,
};
pub use endpoint::Endpoint;
pub use error::{BonjourError, Result};
pub use peer::NetworkPeer;
pub use session::{BonjourSession, INSTANCE_KEY_CHARS};
