//! Mesh service identifiers, handshake wire format and the initiator rule

use std::cmp::Ordering;

use meshlink_core::PublicKey;
use uuid::Uuid;

use crate::error::{BleError, Result};

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Mesh service UUID, advertised by every node
pub const MESH_SERVICE_UUID: Uuid = Uuid::from_u128(0xa2fda8dd_d250_4a64_8b9a_248f50b93c64);

/// Readable characteristic carrying the handshake value
pub const HANDSHAKE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x15d4151b_1008_41c0_85f2_950facf8a3cd);

// ----------------------------------------------------------------------------
// Handshake Value
// ----------------------------------------------------------------------------

/// Leading bytes of the public key carried in the handshake
pub const KEY_SLOT_LEN: usize = 8;

/// PSM (2 bytes, big endian) followed by the key slot
pub const HANDSHAKE_LEN: usize = 2 + KEY_SLOT_LEN;

/// Decoded handshake characteristic value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub psm: u16,
    /// Truncated key, lowercase hex, `2 * KEY_SLOT_LEN` characters
    pub key: PublicKey,
}

impl Handshake {
    /// Build the characteristic value advertised by the peripheral role.
    ///
    /// Keys shorter than the slot are zero padded.
    pub fn encode(psm: u16, key: &PublicKey) -> Result<Vec<u8>> {
        let key_bytes = key
            .to_bytes()
            .map_err(|e| BleError::InvalidPublicKey(e.to_string()))?;

        let mut value = Vec::with_capacity(HANDSHAKE_LEN);
        value.extend_from_slice(&psm.to_be_bytes());
        value.extend(key_bytes.iter().take(KEY_SLOT_LEN));
        value.resize(HANDSHAKE_LEN, 0);
        Ok(value)
    }

    /// Parse a characteristic value; anything but exactly `HANDSHAKE_LEN`
    /// bytes is rejected.
    pub fn decode(value: &[u8]) -> Result<Self> {
        if value.len() != HANDSHAKE_LEN {
            return Err(BleError::InvalidHandshake {
                actual: value.len(),
                expected: HANDSHAKE_LEN,
            });
        }
        Ok(Self {
            psm: u16::from_be_bytes([value[0], value[1]]),
            key: PublicKey::from_bytes(&value[2..]),
        })
    }

    /// Decide who opens the channel, comparing equal-length key prefixes so
    /// both nodes evaluate the same pair of strings.
    pub fn initiator(&self, local: &PublicKey) -> TieBreak {
        tie_break(&self.key, &local.truncated(self.key.as_str().len()))
    }
}

// ----------------------------------------------------------------------------
// Tie Break
// ----------------------------------------------------------------------------

/// Outcome of the initiator rule, seen from the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// We open the L2CAP channel to the remote's PSM
    LocalInitiates,
    /// The remote opens the channel to us; our central role backs off
    RemoteInitiates,
}

/// A node initiates only when the remote key is strictly greater than its
/// own, compared case-insensitively.
pub fn tie_break(remote: &PublicKey, local: &PublicKey) -> TieBreak {
    match remote.cmp_ignore_case(local) {
        Ordering::Greater => TieBreak::LocalInitiates,
        Ordering::Less | Ordering::Equal => TieBreak::RemoteInitiates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0a1b2c3d4e5f60718293a4b5c6d7e8f9";

    #[test]
    fn test_encode_layout() {
        let value = Handshake::encode(0x0081, &PublicKey::new(KEY)).unwrap();
        assert_eq!(value.len(), HANDSHAKE_LEN);
        assert_eq!(&value[..2], &[0x00, 0x81]);
        assert_eq!(&value[2..], &hex::decode(&KEY[..16]).unwrap()[..]);
    }

    #[test]
    fn test_decode_recovers_truncated_key() {
        let value = Handshake::encode(192, &PublicKey::new(KEY.to_uppercase())).unwrap();
        let handshake = Handshake::decode(&value).unwrap();
        assert_eq!(handshake.psm, 192);
        assert_eq!(handshake.key.as_str(), &KEY[..16]);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        for len in [0, HANDSHAKE_LEN - 1, HANDSHAKE_LEN + 1] {
            let err = Handshake::decode(&vec![1u8; len]).unwrap_err();
            assert!(matches!(err, BleError::InvalidHandshake { actual, .. } if actual == len));
        }
    }

    #[test]
    fn test_short_key_is_padded() {
        let value = Handshake::encode(1, &PublicKey::new("abcd")).unwrap();
        assert_eq!(value, vec![0, 1, 0xab, 0xcd, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_rejects_non_hex_key() {
        assert!(matches!(
            Handshake::encode(1, &PublicKey::new("not hex")),
            Err(BleError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_tie_break_rule() {
        let low = PublicKey::new("AAAA");
        let high = PublicKey::new("bbbb");
        assert_eq!(tie_break(&high, &low), TieBreak::LocalInitiates);
        assert_eq!(tie_break(&low, &high), TieBreak::RemoteInitiates);
        assert_eq!(tie_break(&low, &low), TieBreak::RemoteInitiates);
        assert_eq!(
            tie_break(&PublicKey::new("aaaa"), &PublicKey::new("AAAA")),
            TieBreak::RemoteInitiates
        );
    }

    #[test]
    fn test_initiator_compares_prefixes() {
        let local = PublicKey::new("1111111111111111ffff");
        let handshake = Handshake {
            psm: 1,
            key: PublicKey::new("1111111111111112"),
        };
        assert_eq!(handshake.initiator(&local), TieBreak::LocalInitiates);
    }
}
