//! Error types for bucket operations.

use thiserror::Error;

/// Errors that can occur during bucket operations.
#[derive(Debug, Error)]
pub enum BucketError {
    /// Another process holds the bucket directory lock.
    #[error("bucket directory already locked: {0}")]
    AlreadyRunning(String),

    /// Bucket file not found.
    #[error("bucket not found: {0}")]
    NotFound(String),

    /// Bucket content hash did not match its recorded identity.
    #[error("bucket hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// A bucket required by `assume_state` has no local file.
    #[error("missing bucket file for hash {0}")]
    MissingBucket(String),

    /// A bucket's recorded protocol version exceeds what the node
    /// supports.
    #[error("bucket protocol version {version} exceeds maximum {max}")]
    UnsupportedProtocol { version: u32, max: u32 },

    /// Bucket record encoding/decoding error.
    #[error("bucket serialization error: {0}")]
    Serialization(String),

    /// Bucket merge error.
    #[error("bucket merge error: {0}")]
    Merge(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
