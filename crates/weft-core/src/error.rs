//! Error types for the weft session layer.
//!
//! None of these cross the session boundary as panics: a failed packet is
//! dropped with a log line, and operation-level failures are returned to the
//! caller on the operation's own result path.

use thiserror::Error;

/// Convenience alias for session-layer results
pub type Result<T> = std::result::Result<T, SessionError>;

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Packet nonce rejected by the replay window
    #[error("packet dropped due to invalid nonce")]
    InvalidNonce,

    /// Session re-keyed between submission and completion of a crypto op
    #[error("session updated during crypto operation")]
    UpdatedDuringCrypto,

    /// Admission policy rejected the peer
    #[error("session not allowed by policy")]
    PolicyDenied,

    /// Handshake timestamp not strictly increasing
    #[error("handshake timestamp replayed")]
    ReplayTimestamp,

    /// Handshake permanent key mismatches the stored session identity
    #[error("handshake permanent key does not match session")]
    HandleCollision,

    /// Peer presented a low-order public key; no usable shared key exists
    #[error("low-order peer public key rejected")]
    LowOrderKey,

    /// Session is shutting down
    #[error("session closed")]
    Cancelled,

    /// Traffic packet addressed to an unknown handle
    #[error("no session for handle")]
    UnknownHandle,

    /// Protocol packet addressed to a different node
    #[error("protocol packet not addressed to this node")]
    NotForUs,

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] weft_crypto::CryptoError),

    /// Wire decoding failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Wire-format errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the field was complete
    #[error("truncated packet")]
    Truncated,

    /// Varint did not terminate within its maximum width
    #[error("varint overflow")]
    VarintOverflow,

    /// Decoded value does not fit the field type
    #[error("field value out of range")]
    ValueOutOfRange,

    /// Bytes left over after a self-delimiting message
    #[error("trailing bytes after message")]
    Trailing,
}
