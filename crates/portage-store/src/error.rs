//! Storage error types

use thiserror::Error;

/// Errors from the gateway's persistent stores
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record store failed to read, write or commit
    #[error("Record store error: {0}")]
    Record(String),

    /// Disk I/O failed
    #[error("I/O error: {0}")]
    Io(String),

    /// A persisted value could not be decoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A parcel's blob file is gone while its metadata survives
    ///
    /// Unrecoverable for that parcel: callers delete the dangling
    /// metadata and move on.
    #[error("Blob missing: {0}")]
    BlobMissing(String),
}

impl From<postcard::Error> for StoreError {
    fn from(e: postcard::Error) -> Self {
        StoreError::Encoding(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
