//! Property-based tests for the session layer.
//!
//! Uses proptest to verify the nonce, window, and wire invariants across
//! large input spaces.

use proptest::prelude::*;

// ============================================================================
// Nonce Ordering Properties
// ============================================================================

mod nonce_properties {
    use super::*;
    use weft_crypto::BoxNonce;

    proptest! {
        /// The sign of the clamped delta always matches lexicographic order.
        #[test]
        fn minus_sign_matches_lex_order(a in any::<[u8; 24]>(), b in any::<[u8; 24]>()) {
            let na = BoxNonce::from_bytes(a);
            let nb = BoxNonce::from_bytes(b);
            let delta = na.minus(&nb);

            prop_assert_eq!(delta > 0, na > nb);
            prop_assert_eq!(delta < 0, na < nb);
            prop_assert_eq!(delta == 0, a == b);
            prop_assert_eq!(delta, -nb.minus(&na));
            prop_assert!(delta.abs() <= 64);
        }

        /// Increment moves strictly forward and never flips the parity bit.
        #[test]
        fn increment_advances_and_keeps_parity(bytes in any::<[u8; 24]>()) {
            // Stay away from the rollover point.
            prop_assume!(bytes[0] != 0xff);
            let before = BoxNonce::from_bytes(bytes);
            let mut after = before;
            after.increment();

            prop_assert!(after.minus(&before) > 0);
            prop_assert_eq!(after.parity(), before.parity());
        }

        /// Two endpoints on opposite parities never produce the same nonce,
        /// however far either stream advances.
        #[test]
        fn parity_streams_are_disjoint(
            bytes in any::<[u8; 24]>(),
            odd_steps in 0usize..64,
            even_steps in 0usize..64,
        ) {
            prop_assume!(bytes[0] != 0xff);
            let mut odd = BoxNonce::from_bytes(bytes);
            odd.set_parity(true);
            let mut even = BoxNonce::from_bytes(bytes);
            even.set_parity(false);

            for _ in 0..odd_steps {
                odd.increment();
            }
            for _ in 0..even_steps {
                even.increment();
            }
            prop_assert!(odd.parity());
            prop_assert!(!even.parity());
            prop_assert_ne!(odd, even);
        }
    }
}

// ============================================================================
// Nonce Window Properties
// ============================================================================

mod window_properties {
    use super::*;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};
    use weft_core::NonceWindow;
    use weft_crypto::BoxNonce;

    fn nonce(tail: u64) -> BoxNonce {
        let mut bytes = [0u8; 24];
        bytes[16..].copy_from_slice(&(tail << 1).to_be_bytes());
        BoxNonce::from_bytes(bytes)
    }

    proptest! {
        /// For any presentation order, the set of accepted nonces contains no
        /// duplicates and the newest-seen nonce is monotone.
        #[test]
        fn no_nonce_accepted_twice(
            tails in prop::collection::vec(1u64..500, 1..300),
            step_millis in prop::collection::vec(0u64..200, 1..300),
        ) {
            let mut window = NonceWindow::new();
            let start = Instant::now();
            let mut clock = start;
            let mut accepted: HashSet<u64> = HashSet::new();
            let mut newest = *window.newest();

            for (i, &tail) in tails.iter().enumerate() {
                clock += Duration::from_millis(step_millis[i % step_millis.len()]);
                let n = nonce(tail);
                if window.accepts(&n) {
                    prop_assert!(
                        accepted.insert(tail),
                        "nonce {} accepted twice", tail
                    );
                    window.record(n, clock);
                }
                prop_assert!(window.newest().minus(&newest) >= 0);
                newest = *window.newest();
            }
        }

        /// A strictly increasing stream is always accepted in full.
        #[test]
        fn in_order_stream_fully_accepted(start_tail in 1u64..1000, len in 1usize..200) {
            let mut window = NonceWindow::new();
            let now = Instant::now();
            for i in 0..len as u64 {
                let n = nonce(start_tail + i);
                prop_assert!(window.accepts(&n));
                window.record(n, now);
            }
        }
    }
}

// ============================================================================
// Wire Encoding Properties
// ============================================================================

mod wire_properties {
    use super::*;
    use weft_core::wire::{get_varint_i64, get_varint_u64, put_varint_i64, put_varint_u64};
    use weft_core::{ProtocolPacket, SessionPing, TrafficPacket};
    use weft_crypto::{BoxNonce, BoxPublicKey, Handle};

    proptest! {
        /// Varint roundtrip for the full u64 and i64 ranges.
        #[test]
        fn varint_roundtrip(v in any::<u64>(), s in any::<i64>()) {
            let mut buf = Vec::new();
            put_varint_u64(&mut buf, v);
            let (decoded, n) = get_varint_u64(&buf).unwrap();
            prop_assert_eq!(decoded, v);
            prop_assert_eq!(n, buf.len());

            buf.clear();
            put_varint_i64(&mut buf, s);
            let (decoded, n) = get_varint_i64(&buf).unwrap();
            prop_assert_eq!(decoded, s);
            prop_assert_eq!(n, buf.len());
        }

        /// Handshake bodies round-trip bit-exact.
        #[test]
        fn ping_roundtrip(
            perm in any::<[u8; 32]>(),
            handle in any::<[u8; 8]>(),
            ses in any::<[u8; 32]>(),
            coords in prop::collection::vec(any::<u8>(), 0..32),
            tstamp in any::<i64>(),
            is_pong in any::<bool>(),
            mtu in any::<u16>(),
        ) {
            let ping = SessionPing {
                send_perm_pub: BoxPublicKey::from_bytes(perm),
                handle: Handle::from_bytes(handle),
                send_ses_pub: BoxPublicKey::from_bytes(ses),
                coords,
                tstamp,
                is_pong,
                mtu,
            };
            let encoded = ping.encode();
            prop_assert_eq!(SessionPing::decode(&encoded).unwrap(), ping);
        }

        /// Traffic and protocol packets round-trip and keep their type tags
        /// distinct.
        #[test]
        fn packet_roundtrip(
            coords in prop::collection::vec(any::<u8>(), 0..32),
            handle in any::<[u8; 8]>(),
            nonce in any::<[u8; 24]>(),
            payload in prop::collection::vec(any::<u8>(), 0..256),
            to_key in any::<[u8; 32]>(),
            from_key in any::<[u8; 32]>(),
        ) {
            let traffic = TrafficPacket {
                coords: coords.clone(),
                handle: Handle::from_bytes(handle),
                nonce: BoxNonce::from_bytes(nonce),
                payload: payload.clone(),
            };
            prop_assert_eq!(TrafficPacket::decode(&traffic.encode()).unwrap(), traffic.clone());
            prop_assert!(ProtocolPacket::decode(&traffic.encode()).is_err());

            let protocol = ProtocolPacket {
                coords,
                to_key: BoxPublicKey::from_bytes(to_key),
                from_key: BoxPublicKey::from_bytes(from_key),
                nonce: BoxNonce::from_bytes(nonce),
                payload,
            };
            prop_assert_eq!(ProtocolPacket::decode(&protocol.encode()).unwrap(), protocol.clone());
            prop_assert!(TrafficPacket::decode(&protocol.encode()).is_err());
        }
    }
}

// ============================================================================
// Box Sealing Properties
// ============================================================================

mod sealing_properties {
    use super::*;
    use weft_crypto::{BoxNonce, SharedKey};

    proptest! {
        /// Seal then open recovers the plaintext for any key, nonce, and
        /// message.
        #[test]
        fn seal_open_roundtrip(
            key_bytes in any::<[u8; 32]>(),
            nonce_bytes in any::<[u8; 24]>(),
            plaintext in prop::collection::vec(any::<u8>(), 0..1024),
        ) {
            let key = SharedKey::from_bytes(key_bytes);
            let nonce = BoxNonce::from_bytes(nonce_bytes);

            let sealed = key.seal(&nonce, &plaintext).unwrap();
            prop_assert_eq!(sealed.len(), plaintext.len() + 16);
            prop_assert_eq!(key.open(&nonce, &sealed).unwrap(), plaintext);
        }

        /// Opening under a different key fails authentication.
        #[test]
        fn open_rejects_wrong_key(
            key_a in any::<[u8; 32]>(),
            key_b in any::<[u8; 32]>(),
            nonce_bytes in any::<[u8; 24]>(),
            plaintext in prop::collection::vec(any::<u8>(), 1..256),
        ) {
            prop_assume!(key_a != key_b);
            let nonce = BoxNonce::from_bytes(nonce_bytes);
            let sealed = SharedKey::from_bytes(key_a).seal(&nonce, &plaintext).unwrap();
            prop_assert!(SharedKey::from_bytes(key_b).open(&nonce, &sealed).is_err());
        }
    }
}
