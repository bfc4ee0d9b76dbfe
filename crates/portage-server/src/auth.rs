//! Endpoint pre-registration authorizations
//!
//! Registering an endpoint is a two-step handshake: the application first
//! asks for an authorization, a short-lived statement signed by the node
//! key binding a fresh nonce to the endpoint's public key and the
//! application id it registers under, then presents it back with the
//! registration. The nonce burns on use, so one authorization registers
//! exactly one endpoint exactly once.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use portage_crypto::{CryptoResult, KeyBytes, NodeKeyPair, verify_signature};

/// How long an issued authorization stays presentable
pub const ENDPOINT_AUTH_TTL_SECONDS: i64 = 10;

/// What the node key signs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointAuthorization {
    pub endpoint_key: KeyBytes,
    pub application_id: String,
    pub nonce: [u8; 32],
    pub expires_at: DateTime<Utc>,
}

/// An authorization plus the node-key signature over it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedAuthorization {
    pub authorization: EndpointAuthorization,
    pub signature: Vec<u8>,
}

impl SignedAuthorization {
    /// Issue a fresh authorization binding `endpoint_key` to
    /// `application_id`
    pub fn issue(
        keys: &NodeKeyPair,
        endpoint_key: KeyBytes,
        application_id: &str,
    ) -> CryptoResult<Self> {
        let authorization = EndpointAuthorization {
            endpoint_key,
            application_id: application_id.to_string(),
            nonce: rand::random(),
            expires_at: Utc::now() + Duration::seconds(ENDPOINT_AUTH_TTL_SECONDS),
        };
        let signature = keys.sign(&postcard::to_allocvec(&authorization)?);
        Ok(Self {
            authorization,
            signature,
        })
    }

    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }
}

/// Why a presented authorization was refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed authorization")]
    Malformed,
    #[error("authorization signature invalid")]
    BadSignature,
    #[error("authorization expired")]
    Expired,
    #[error("authorization does not name this endpoint key")]
    WrongKey,
    #[error("authorization was issued to a different application")]
    WrongApplication,
    #[error("authorization already used")]
    NonceUsed,
}

/// Validates presented authorizations and burns their nonces
#[derive(Default)]
pub struct AuthorizationVerifier {
    used_nonces: DashMap<[u8; 32], DateTime<Utc>>,
}

impl AuthorizationVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check an authorization presented for `endpoint_key` under
    /// `application_id` and burn its nonce
    pub fn verify(
        &self,
        bytes: &[u8],
        endpoint_key: &KeyBytes,
        application_id: &str,
        node_key: &KeyBytes,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let signed: SignedAuthorization =
            postcard::from_bytes(bytes).map_err(|_| AuthError::Malformed)?;
        let tbs = postcard::to_allocvec(&signed.authorization)
            .map_err(|_| AuthError::Malformed)?;
        verify_signature(node_key, &tbs, &signed.signature)
            .map_err(|_| AuthError::BadSignature)?;
        if signed.authorization.expires_at <= now {
            return Err(AuthError::Expired);
        }
        if &signed.authorization.endpoint_key != endpoint_key {
            return Err(AuthError::WrongKey);
        }
        if signed.authorization.application_id != application_id {
            return Err(AuthError::WrongApplication);
        }
        // Burn the nonce; a second presentation of the same authorization
        // fails here
        if self
            .used_nonces
            .insert(signed.authorization.nonce, signed.authorization.expires_at)
            .is_some()
        {
            return Err(AuthError::NonceUsed);
        }
        Ok(())
    }

    /// Drop burned nonces whose authorizations have expired anyway
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.used_nonces.len();
        self.used_nonces.retain(|_, expires_at| *expires_at > now);
        before - self.used_nonces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let node = NodeKeyPair::generate();
        let endpoint = NodeKeyPair::generate();
        let verifier = AuthorizationVerifier::new();

        let signed =
            SignedAuthorization::issue(&node, endpoint.public_bytes(), "app.example").unwrap();
        let bytes = signed.to_bytes().unwrap();
        verifier
            .verify(
                &bytes,
                &endpoint.public_bytes(),
                "app.example",
                &node.public_bytes(),
                Utc::now(),
            )
            .unwrap();

        // Same authorization a second time: nonce already burned
        let err = verifier
            .verify(
                &bytes,
                &endpoint.public_bytes(),
                "app.example",
                &node.public_bytes(),
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err, AuthError::NonceUsed);
    }

    #[test]
    fn test_expired_authorization_refused() {
        let node = NodeKeyPair::generate();
        let endpoint = NodeKeyPair::generate();
        let verifier = AuthorizationVerifier::new();

        let signed =
            SignedAuthorization::issue(&node, endpoint.public_bytes(), "app.example").unwrap();
        let later = Utc::now() + Duration::seconds(ENDPOINT_AUTH_TTL_SECONDS + 1);
        let err = verifier
            .verify(
                &signed.to_bytes().unwrap(),
                &endpoint.public_bytes(),
                "app.example",
                &node.public_bytes(),
                later,
            )
            .unwrap_err();
        assert_eq!(err, AuthError::Expired);
    }

    #[test]
    fn test_authorization_bound_to_endpoint_key() {
        let node = NodeKeyPair::generate();
        let endpoint = NodeKeyPair::generate();
        let other = NodeKeyPair::generate();
        let verifier = AuthorizationVerifier::new();

        let signed =
            SignedAuthorization::issue(&node, endpoint.public_bytes(), "app.example").unwrap();
        let err = verifier
            .verify(
                &signed.to_bytes().unwrap(),
                &other.public_bytes(),
                "app.example",
                &node.public_bytes(),
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err, AuthError::WrongKey);
    }

    #[test]
    fn test_authorization_bound_to_application() {
        let node = NodeKeyPair::generate();
        let endpoint = NodeKeyPair::generate();
        let verifier = AuthorizationVerifier::new();

        let signed =
            SignedAuthorization::issue(&node, endpoint.public_bytes(), "app.example").unwrap();
        let err = verifier
            .verify(
                &signed.to_bytes().unwrap(),
                &endpoint.public_bytes(),
                "other.example",
                &node.public_bytes(),
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err, AuthError::WrongApplication);
    }

    #[test]
    fn test_forged_signature_refused() {
        let node = NodeKeyPair::generate();
        let impostor = NodeKeyPair::generate();
        let endpoint = NodeKeyPair::generate();
        let verifier = AuthorizationVerifier::new();

        let signed =
            SignedAuthorization::issue(&impostor, endpoint.public_bytes(), "app.example").unwrap();
        let err = verifier
            .verify(
                &signed.to_bytes().unwrap(),
                &endpoint.public_bytes(),
                "app.example",
                &node.public_bytes(),
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err, AuthError::BadSignature);
    }

    #[test]
    fn test_nonce_sweep() {
        let node = NodeKeyPair::generate();
        let endpoint = NodeKeyPair::generate();
        let verifier = AuthorizationVerifier::new();
        let signed =
            SignedAuthorization::issue(&node, endpoint.public_bytes(), "app.example").unwrap();
        verifier
            .verify(
                &signed.to_bytes().unwrap(),
                &endpoint.public_bytes(),
                "app.example",
                &node.public_bytes(),
                Utc::now(),
            )
            .unwrap();

        assert_eq!(verifier.sweep(Utc::now()), 0);
        let later = Utc::now() + Duration::seconds(ENDPOINT_AUTH_TTL_SECONDS + 1);
        assert_eq!(verifier.sweep(later), 1);
    }
}
