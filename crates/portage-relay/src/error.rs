//! Relay error types

use thiserror::Error;

use portage_crypto::CryptoError;
use portage_store::StoreError;

/// Errors from the relay engines
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Remote client error: {0}")]
    Client(#[from] ClientError),
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors from the remote gateway and courier clients
///
/// `Transient` aborts only the current attempt; the item stays queued.
/// `Protocol` and `Rejected` are not retried.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection refused, timeout, or a server-side failure; retry later
    #[error("Transient transport failure: {0}")]
    Transient(String),

    /// The remote side spoke the protocol wrong
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote side terminally refused the operation
    #[error("Rejected by remote peer: {0}")]
    Rejected(String),
}

/// Errors ending a courier sync run
#[derive(Debug, Error)]
pub enum CourierSyncError {
    /// No courier was discovered, or the discovered one failed the
    /// liveness probe; the run never entered cargo collection
    #[error("No reachable courier")]
    NotReachable,

    #[error("Cargo delivery failed: {0}")]
    Delivery(String),

    #[error("Cargo collection failed: {0}")]
    Collection(String),

    #[error(transparent)]
    Relay(#[from] RelayError),
}
