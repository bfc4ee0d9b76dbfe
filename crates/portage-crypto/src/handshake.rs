//! Collection-channel control messages
//!
//! The parcel-collection channel (local control server and public
//! gateway alike) starts with a challenge–response handshake: the server
//! sends a random nonce, the client answers with one detached signature
//! per endpoint it claims, each accompanied by the certificate proving
//! the claim. Only after every signature verifies against the trusted
//! set does any parcel flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use portage_core::PrivateAddress;

use crate::certificate::{Certificate, validate_chain};
use crate::error::{CryptoResult, HandshakeError};
use crate::keys::{KeyBytes, NodeKeyPair, verify_signature};

/// Length of the server-generated handshake nonce
pub const NONCE_LEN: usize = 32;

/// Generate a fresh handshake nonce
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    rand::random()
}

/// One endpoint's proof of ownership over the nonce
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceSignature {
    /// Certificate of the claiming endpoint
    pub certificate: Certificate,
    /// Detached signature over the raw nonce bytes
    pub signature: Vec<u8>,
}

impl NonceSignature {
    /// Sign a nonce on behalf of the endpoint holding `keys`
    pub fn create(nonce: &[u8], keys: &NodeKeyPair, certificate: Certificate) -> Self {
        Self {
            certificate,
            signature: keys.sign(nonce),
        }
    }
}

/// The client's answer to the handshake challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub signatures: Vec<NonceSignature>,
}

impl HandshakeResponse {
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }
}

/// Verify a raw handshake response against the nonce and trusted keys
///
/// Returns the private addresses of every verified signer. Fails closed:
/// a single bad signature aborts the whole handshake even when others
/// verify.
pub fn verify_handshake_response(
    nonce: &[u8],
    response_bytes: &[u8],
    trusted: &[KeyBytes],
    now: DateTime<Utc>,
) -> Result<Vec<PrivateAddress>, HandshakeError> {
    let response: HandshakeResponse =
        postcard::from_bytes(response_bytes).map_err(|_| HandshakeError::Malformed)?;
    if response.signatures.is_empty() {
        return Err(HandshakeError::NoSignatures);
    }

    let mut addresses = Vec::with_capacity(response.signatures.len());
    for entry in &response.signatures {
        validate_chain(std::slice::from_ref(&entry.certificate), trusted, now)
            .map_err(|_| HandshakeError::UntrustedSigner)?;
        verify_signature(entry.certificate.subject_key(), nonce, &entry.signature)
            .map_err(|_| HandshakeError::InvalidSignature)?;
        addresses.push(entry.certificate.subject_address());
    }
    Ok(addresses)
}

/// A parcel offered on the collection channel, tagged with its
/// per-session delivery id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParcelDelivery {
    pub delivery_id: String,
    pub parcel: Vec<u8>,
}

impl ParcelDelivery {
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HandshakeError> {
        postcard::from_bytes(bytes).map_err(|_| HandshakeError::Malformed)
    }
}

/// Client acknowledgement of a delivery id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub delivery_id: String,
}

impl DeliveryAck {
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HandshakeError> {
        postcard::from_bytes(bytes).map_err(|_| HandshakeError::Malformed)
    }
}
