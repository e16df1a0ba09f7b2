//! # Weft Crypto
//!
//! Cryptographic primitives for the weft session layer.
//!
//! This crate provides:
//! - X25519 key agreement for permanent and per-session keys
//! - `XChaCha20-Poly1305` authenticated encryption with explicit 24-byte nonces
//! - BLAKE3 key derivation from raw Diffie-Hellman output
//! - Counter nonces with a parity bit and a clamped signed delta
//! - Random session handles
//!
//! Nonces and handles draw from the OS CSPRNG; key generation takes a
//! caller-supplied RNG.
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | KDF | BLAKE3 derive_key | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
pub mod handle;
pub mod keys;
pub mod nonce;

pub use error::CryptoError;
pub use handle::Handle;
pub use keys::{BoxPublicKey, BoxSecretKey, SharedKey};
pub use nonce::BoxNonce;

/// Box public/secret key size
pub const BOX_KEY_SIZE: usize = 32;

/// Derived shared key size
pub const SHARED_KEY_SIZE: usize = 32;

/// Box nonce size
pub const BOX_NONCE_SIZE: usize = 24;

/// Session handle size
pub const HANDLE_SIZE: usize = 8;

/// AEAD authentication tag size
pub const BOX_OVERHEAD: usize = 16;
