//! Crypto-specific error types

use thiserror::Error;

/// Errors from key, certificate and envelope operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key bytes were the wrong size or not a valid curve point
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A detached signature did not verify
    #[error("Signature verification failed")]
    SignatureVerification,

    /// A serialized structure could not be decoded
    #[error("Malformed encoding: {0}")]
    Malformed(String),

    /// A certificate or chain failed structural validation
    #[error("Invalid certificate: {0}")]
    CertificateInvalid(String),

    /// A certificate is outside its validity window
    #[error("Certificate expired or not yet valid")]
    CertificateExpired,

    /// A chain does not root at any trusted key
    #[error("Untrusted signer")]
    UntrustedSigner,

    /// The credential store failed to read or write
    #[error("Credential store error: {0}")]
    CredentialStore(String),
}

impl From<postcard::Error> for CryptoError {
    fn from(e: postcard::Error) -> Self {
        CryptoError::Malformed(e.to_string())
    }
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors from the collection-channel challenge–response handshake
///
/// Each variant maps to a distinct close reason so a misbehaving client
/// can tell exactly why the channel was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Malformed handshake response")]
    Malformed,

    #[error("Handshake response carried no nonce signatures")]
    NoSignatures,

    #[error("Invalid nonce signature")]
    InvalidSignature,

    #[error("Nonce signed by an untrusted certificate")]
    UntrustedSigner,
}

impl HandshakeError {
    /// The close reason sent on the channel when this error aborts it
    pub fn close_reason(&self) -> &'static str {
        match self {
            HandshakeError::Malformed => "malformed handshake",
            HandshakeError::NoSignatures => "no nonce signatures",
            HandshakeError::InvalidSignature => "invalid nonce signature",
            HandshakeError::UntrustedSigner => "untrusted signer",
        }
    }
}
