//! X25519 box keys and the derived symmetric session key.
//!
//! Both permanent identity keys and per-session ephemeral keys use the same
//! X25519 key types. A [`SharedKey`] is derived by hashing the raw
//! Diffie-Hellman output with BLAKE3, and seals/opens messages with
//! `XChaCha20-Poly1305` under an explicit 24-byte nonce.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand_core::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::nonce::BoxNonce;
use crate::{BOX_KEY_SIZE, CryptoError};

/// Domain separation string for shared-key derivation.
const SHARED_KEY_CONTEXT: &str = "weft-crypto v1 box shared key";

/// X25519 public key (32 bytes).
///
/// Used both as a long-lived peer identity and as a per-session ephemeral key.
/// The derived byte-lexicographic ordering decides nonce parity between two
/// session endpoints.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoxPublicKey([u8; BOX_KEY_SIZE]);

/// X25519 secret key (32 bytes).
pub struct BoxSecretKey(x25519_dalek::StaticSecret);

/// Symmetric key derived by key agreement (32 bytes).
///
/// Equality is constant-time; the comparison is used to detect re-keying
/// between the two halves of a pipelined crypto operation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; BOX_KEY_SIZE]);

impl BoxPublicKey {
    /// Create a public key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; BOX_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BOX_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for BoxPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Truncated, same as the log format
        write!(f, "BoxPublicKey({}..)", hex_prefix(&self.0))
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes[..8].iter().map(|b| format!("{b:02x}")).collect()
}

impl BoxSecretKey {
    /// Generate a new random secret key with RFC 7748 clamping.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Derive the public key from this secret key.
    #[must_use]
    pub fn public_key(&self) -> BoxPublicKey {
        BoxPublicKey(*x25519_dalek::PublicKey::from(&self.0).as_bytes())
    }

    /// Derive the symmetric key shared with `peer`.
    ///
    /// The raw X25519 output is passed through BLAKE3 `derive_key` with a
    /// fixed context, so derivation is deterministic and both endpoints reach
    /// the same key regardless of which side computes it.
    ///
    /// Returns `None` if the peer's public key is a low-order point
    /// (security check).
    #[must_use]
    pub fn shared_key(&self, peer: &BoxPublicKey) -> Option<SharedKey> {
        let point = x25519_dalek::PublicKey::from(peer.0);
        let dh = self.0.diffie_hellman(&point);

        // Check for low-order points
        if dh.as_bytes() == &[0u8; 32] {
            return None;
        }

        Some(SharedKey(blake3::derive_key(SHARED_KEY_CONTEXT, dh.as_bytes())))
    }

    /// Export as bytes (for serialization).
    ///
    /// # Security
    ///
    /// The returned bytes contain the raw secret key. Handle with care.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; BOX_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Import from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; BOX_KEY_SIZE]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }
}

impl Clone for BoxSecretKey {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl SharedKey {
    /// Create a shared key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; BOX_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Seal `plaintext` under this key and an explicit nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] on AEAD failure.
    pub fn seal(&self, nonce: &BoxNonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.0));
        cipher
            .encrypt(XNonce::from_slice(nonce.as_bytes()), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open `ciphertext` sealed under this key and nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if authentication fails,
    /// which covers truncation, tampering, a wrong key, or a wrong nonce.
    pub fn open(&self, nonce: &BoxNonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.0));
        cipher
            .decrypt(XNonce::from_slice(nonce.as_bytes()), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl PartialEq for SharedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_slice().ct_eq(other.0.as_slice()).into()
    }
}

impl Eq for SharedKey {}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Truncated, same as the log format
        write!(f, "SharedKey({}..)", hex_prefix(&self.0))
    }
}
