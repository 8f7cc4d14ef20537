//! Property tests for the handshake value and the initiator rule
//!
//! Two nodes each read the other's handshake and apply the rule to their own
//! key. For every pair of distinct key prefixes exactly one of them may open
//! the channel.

use meshlink_ble::{tie_break, Handshake, TieBreak, HANDSHAKE_LEN, KEY_SLOT_LEN};
use meshlink_core::PublicKey;
use proptest::prelude::*;

/// Routing keys as the engine reports them: 64 hex characters, either case
fn arb_key() -> impl Strategy<Value = PublicKey> {
    (any::<[u8; 32]>(), any::<bool>()).prop_map(|(bytes, upper)| {
        let key = hex::encode(bytes);
        PublicKey::new(if upper { key.to_uppercase() } else { key })
    })
}

fn decision(local: &PublicKey, remote: &PublicKey, psm: u16) -> TieBreak {
    let value = Handshake::encode(psm, remote).unwrap();
    Handshake::decode(&value).unwrap().initiator(local)
}

proptest! {
    /// Property: distinct prefixes produce exactly one initiator
    #[test]
    fn exactly_one_side_initiates(a in arb_key(), b in arb_key(), psm in any::<u16>()) {
        let prefix = 2 * KEY_SLOT_LEN;
        prop_assume!(!a.truncated(prefix).as_str().eq_ignore_ascii_case(b.truncated(prefix).as_str()));

        let a_sees = decision(&a, &b, psm);
        let b_sees = decision(&b, &a, psm);
        prop_assert_ne!(a_sees, b_sees);
    }

    /// Property: the rule is antisymmetric on raw keys
    #[test]
    fn tie_break_is_antisymmetric(a in arb_key(), b in arb_key()) {
        prop_assume!(a.cmp_ignore_case(&b) != std::cmp::Ordering::Equal);
        prop_assert_ne!(tie_break(&a, &b), tie_break(&b, &a));
    }

    /// Property: every handshake value is exactly HANDSHAKE_LEN bytes and
    /// carries the PSM big endian
    #[test]
    fn handshake_value_layout(key in arb_key(), psm in any::<u16>()) {
        let value = Handshake::encode(psm, &key).unwrap();
        prop_assert_eq!(value.len(), HANDSHAKE_LEN);
        prop_assert_eq!(u16::from_be_bytes([value[0], value[1]]), psm);
    }

    /// Property: values of any other length are rejected
    #[test]
    fn wrong_length_is_rejected(value in prop::collection::vec(any::<u8>(), 0..64)) {
        prop_assume!(value.len() != HANDSHAKE_LEN);
        prop_assert!(Handshake::decode(&value).is_err());
    }
}

#[test]
fn test_same_prefix_means_nobody_initiates() {
    let a = PublicKey::new("00112233445566770000000000000000");
    let b = PublicKey::new("0011223344556677ffffffffffffffff");
    assert_eq!(decision(&a, &b, 0x0081), TieBreak::RemoteInitiates);
    assert_eq!(decision(&b, &a, 0x0081), TieBreak::RemoteInitiates);
}

#[test]
fn test_case_does_not_change_the_outcome() {
    let lower = PublicKey::new("aaaaaaaaaaaaaaaa");
    let upper = PublicKey::new("BBBBBBBBBBBBBBBB");
    assert_eq!(tie_break(&upper, &lower), TieBreak::LocalInitiates);
    assert_eq!(tie_break(&lower, &upper), TieBreak::RemoteInitiates);
}
