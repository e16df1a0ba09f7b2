//! Counter nonces for session traffic.
//!
//! A [`BoxNonce`] is a 24-byte big-endian counter. Each endpoint of a session
//! pins the low bit of the last byte (the parity bit) at session creation, and
//! [`BoxNonce::increment`] advances by two, so the two nonce streams under a
//! shared key never collide.

use crate::{BOX_NONCE_SIZE, CryptoError};

/// Largest magnitude returned by [`BoxNonce::minus`].
///
/// Matches the out-of-order window capacity downstream; deltas beyond it carry
/// no extra information for acceptance decisions.
const DELTA_CLAMP: i64 = 64;

/// 24-byte big-endian counter nonce with a parity bit.
///
/// The derived ordering is plain byte-lexicographic order, which agrees with
/// the sign of [`BoxNonce::minus`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoxNonce([u8; BOX_NONCE_SIZE]);

impl BoxNonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; BOX_NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random starting nonce from the OS CSPRNG.
    ///
    /// The leading byte is re-rolled away from `0xff` so that a fresh session
    /// is unlikely to roll over within its lifetime. Rollover is not unsafe,
    /// but it forces the session to be reopened.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; BOX_NONCE_SIZE];
        loop {
            getrandom::getrandom(&mut bytes).map_err(|_| CryptoError::RandomFailed)?;
            if bytes[0] != 0xff {
                return Ok(Self(bytes));
            }
        }
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BOX_NONCE_SIZE] {
        &self.0
    }

    /// Advance the counter by two, preserving the parity bit.
    pub fn increment(&mut self) {
        let mut carry = 2u16;
        for b in self.0.iter_mut().rev() {
            let sum = u16::from(*b) + carry;
            *b = sum as u8;
            carry = sum >> 8;
            if carry == 0 {
                break;
            }
        }
    }

    /// Pin the parity bit: `odd` forces the low bit of the last byte to 1,
    /// otherwise to 0.
    pub fn set_parity(&mut self, odd: bool) {
        if odd {
            self.0[BOX_NONCE_SIZE - 1] |= 0x01;
        } else {
            self.0[BOX_NONCE_SIZE - 1] &= 0xfe;
        }
    }

    /// The parity bit (low bit of the last byte).
    #[must_use]
    pub fn parity(&self) -> bool {
        self.0[BOX_NONCE_SIZE - 1] & 0x01 != 0
    }

    /// Signed distance from `other` to `self`, clamped to a small magnitude.
    ///
    /// Positive iff `self` is newer than `other` in counter order. The
    /// accumulator is clamped at every byte so the result stays within
    /// `±64`; the sign always matches full lexicographic comparison.
    #[must_use]
    pub fn minus(&self, other: &Self) -> i64 {
        let mut diff: i64 = 0;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            diff *= 256;
            diff += i64::from(*a) - i64::from(*b);
            diff = diff.clamp(-DELTA_CLAMP, DELTA_CLAMP);
        }
        diff
    }
}
