//! Error types for vellum-store
//!
//! This module defines the error types used throughout the blob storage
//! crate.

use thiserror::Error;

/// Errors that can occur in blob store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error during store operations
    #[error("I/O error: {0}")]
    Io(String),

    /// Requested blob was not found where absence is a hard failure
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// Two overlapping transactions touched the same key
    #[error("Concurrent update on key: {0}")]
    ConcurrentUpdate(String),

    /// Operation invoked on a store layer that cannot support it
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// Key cannot be mapped to a storage path
    #[error("Invalid blob key: {0}")]
    InvalidKey(String),

    /// Digest algorithm name not recognized
    #[error("Unknown digest algorithm: {0}")]
    UnknownDigest(String),

    /// Record mode only stores blobs at the main `content` xpath
    #[error("Cannot store blob at xpath '{0}' in record mode")]
    InvalidXpath(String),

    /// Record mode requires a document identity to derive the key from
    #[error("Record mode requires a document id")]
    MissingDocId,

    /// A write completed without producing a key
    #[error("Write produced no key")]
    MissingKey,
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl StoreError {
    /// Create a new NotFound error
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// Create a new InvalidKey error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey(key.into())
    }
}
