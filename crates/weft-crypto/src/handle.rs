//! Random session handles.

use crate::{CryptoError, HANDLE_SIZE};

/// 8-byte opaque session identifier, local to one node.
///
/// A handle is placed in every outbound traffic packet so the receiver can
/// look up the session without scanning keys. It is not globally unique.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle([u8; HANDLE_SIZE]);

impl Handle {
    /// Generate a random handle from the OS CSPRNG.
    ///
    /// Collisions between live handles on one node are left to chance; at 64
    /// random bits they are negligible against any plausible session count.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; HANDLE_SIZE];
        getrandom::getrandom(&mut bytes).map_err(|_| CryptoError::RandomFailed)?;
        Ok(Self(bytes))
    }

    /// Create a handle from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; HANDLE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HANDLE_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}
