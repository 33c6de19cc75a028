//! Fundamental types, particularly the [`Hash256`] content hash.

use sha2::{Digest, Sha256};
use std::fmt;

/// Error parsing a [`Hash256`] from a hexadecimal string.
#[derive(Debug, thiserror::Error)]
#[error("invalid hash hex string: {0}")]
pub struct HashParseError(String);

/// A 32-byte SHA-256 hash.
///
/// This is the canonical hash type used throughout strata: bucket
/// identities, the aggregate bucket-list hash, and the ledger-state
/// digest stamped into headers are all `Hash256` values.
///
/// # Examples
///
/// ```rust
/// use strata_common::Hash256;
///
/// let hash = Hash256::hash(b"hello world");
/// assert!(!hash.is_zero());
///
/// let hex_str = hash.to_hex();
/// let parsed = Hash256::from_hex(&hex_str).unwrap();
/// assert_eq!(hash, parsed);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (all bytes are 0x00).
    ///
    /// Used as the identity of the canonical empty bucket and as a
    /// placeholder in manifests.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Compute the SHA-256 hash of arbitrary data.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from_digest(hasher)
    }

    /// Finalize a streaming [`Sha256`] digest into a `Hash256`.
    pub fn from_digest(hasher: Sha256) -> Self {
        let result = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Creates a `Hash256` from a 32-byte array.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Creates a `Hash256` from a hexadecimal string (64 hex digits).
    pub fn from_hex(s: &str) -> Result<Self, HashParseError> {
        let raw = hex::decode(s).map_err(|_| HashParseError(s.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| HashParseError(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// Returns the lowercase hexadecimal representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the all-zero sentinel hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}
