//! Identity types shared by every transport

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Device and Key Identities
// ----------------------------------------------------------------------------

/// Identifies one local-transport peer: a BLE peripheral identity or a
/// network endpoint description.
///
/// Stable for the lifetime of one OS-level peripheral/connection object and
/// never reused across distinct connection attempts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceUuid(String);

impl DeviceUuid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceUuid {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceUuid {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Hex-encoded public key of a routing-engine node.
///
/// Equality is exact; ordering for connection decisions goes through
/// [`PublicKey::cmp_ignore_case`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(String);

impl PublicKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep at most `chars` leading characters of the key.
    pub fn truncated(&self, chars: usize) -> PublicKey {
        PublicKey(self.0.chars().take(chars).collect())
    }

    /// Decode the hex form into raw bytes.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.0)
    }

    /// Build a key from raw bytes, lowercase hex encoded.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Lexicographic comparison of the uppercased forms.
    pub fn cmp_ignore_case(&self, other: &PublicKey) -> Ordering {
        self.0.to_uppercase().cmp(&other.0.to_uppercase())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PublicKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for PublicKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

// ----------------------------------------------------------------------------
// Peer Types
// ----------------------------------------------------------------------------

/// Transport discriminator passed to the engine when allocating conduits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    Static,
    Multicast,
    Bluetooth,
    Bonjour,
}

impl PeerType {
    /// Label used for conduit zones and log lines
    pub fn label(&self) -> &'static str {
        match self {
            PeerType::Static => "static",
            PeerType::Multicast => "multicast",
            PeerType::Bluetooth => "bluetooth",
            PeerType::Bonjour => "bonjour",
        }
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ----------------------------------------------------------------------------
// Link Identity
// ----------------------------------------------------------------------------

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one peer transport instance.
///
/// Lets stop notifications tell an old, replaced transport from the one
/// currently registered for the same device or endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}
