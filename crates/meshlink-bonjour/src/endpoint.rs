//! Identity of a remote network endpoint

use std::fmt;
use std::net::SocketAddr;

/// Key of the session's peer map and the zone label of the peer's conduit
///
/// Outbound peers are keyed by the announced service they were dialled
/// through, inbound peers by the socket address they connected from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A browsed mDNS service, by full name
    Service { name: String },
    /// A remote socket
    Address(SocketAddr),
}

impl Endpoint {
    pub fn service(name: impl Into<String>) -> Self {
        Endpoint::Service { name: name.into() }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, Endpoint::Service { .. })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Service { name } => write!(f, "{}", name),
            Endpoint::Address(addr) => write!(f, "{}", addr),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Address(addr)
    }
}
