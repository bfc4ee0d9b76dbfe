//! Error types shared across the Portage workspace

use thiserror::Error;

/// Top-level error for gateway operations that cross component boundaries
///
/// Component crates define their own error enums; this umbrella exists for
/// callers (the node binary, integration tests) that drive several
/// components in one flow.
#[derive(Debug, Error)]
pub enum PortageError {
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Server error: {0}")]
    Server(String),
}

/// Errors related to node and endpoint addressing
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Not a private-form address: {0}")]
    NotPrivateForm(String),
}

/// Result type alias for cross-component operations
pub type PortageResult<T> = Result<T, PortageError>;
