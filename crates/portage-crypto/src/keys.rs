//! Node key pair and secret-byte handling
//!
//! One long-lived ed25519 key pair identifies the gateway node. The
//! secret half only ever leaves this module wrapped in [`SecureBytes`],
//! which zeroizes on drop.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use portage_core::PrivateAddress;

use crate::error::{CryptoError, CryptoResult};

/// Size of an ed25519 public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an ed25519 secret key in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of a detached ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Public key bytes, used as the trust-anchor currency everywhere
pub type KeyBytes = [u8; PUBLIC_KEY_SIZE];

/// Secure byte container that zeroizes on drop
///
/// Use this for key material that must not persist in memory after use.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureBytes(Vec<u8>);

impl SecureBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for SecureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The node's long-lived ed25519 identity key pair
///
/// Algorithm and size are fixed by policy; callers never choose them.
#[derive(Clone)]
pub struct NodeKeyPair {
    signing_key: SigningKey,
}

impl NodeKeyPair {
    /// Generate a fresh random key pair
    pub fn generate() -> Self {
        let seed: [u8; SECRET_KEY_SIZE] = rand::random();
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Reconstruct a key pair from persisted secret bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let seed: [u8; SECRET_KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "Expected {} secret bytes, got {}",
                SECRET_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Export the secret half for persistence
    pub fn secret_bytes(&self) -> SecureBytes {
        SecureBytes::new(self.signing_key.to_bytes().to_vec())
    }

    /// The public key bytes
    pub fn public_bytes(&self) -> KeyBytes {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The private address derived from the public key
    pub fn address(&self) -> PrivateAddress {
        PrivateAddress::derive(&self.public_bytes())
    }

    /// Sign a message, returning the detached signature bytes
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_vec()
    }
}

impl std::fmt::Debug for NodeKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeyPair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Verify a detached signature against raw public key bytes
pub fn verify_signature(public_key: &KeyBytes, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig_bytes: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| CryptoError::SignatureVerification)?;
    let signature = Signature::from_bytes(&sig_bytes);
    key.verify(message, &signature)
        .map_err(|_| CryptoError::SignatureVerification)
}
