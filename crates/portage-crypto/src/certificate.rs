//! Certificates and certificate chains
//!
//! A certificate binds a subject key to an issuer key over a validity
//! window. The signature is a detached ed25519 signature by the issuer
//! over the postcard encoding of the to-be-signed fields. Chains are
//! leaf-first; a chain is valid when every link verifies, every
//! certificate is inside its validity window, and the final issuer is a
//! trusted key.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use portage_core::PrivateAddress;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyBytes, NodeKeyPair, verify_signature};

/// Fields covered by the certificate signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TbsCertificate {
    subject_key: KeyBytes,
    issuer_key: KeyBytes,
    serial: u64,
    not_before: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// A signed binding of a subject key to an issuer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    tbs: TbsCertificate,
    signature: Vec<u8>,
}

impl Certificate {
    /// Issue a certificate for `subject_key`, signed by `issuer`
    pub fn issue(
        subject_key: KeyBytes,
        issuer: &NodeKeyPair,
        validity: Duration,
    ) -> CryptoResult<Self> {
        let now = Utc::now();
        let tbs = TbsCertificate {
            subject_key,
            issuer_key: issuer.public_bytes(),
            serial: rand::random(),
            not_before: now,
            expires_at: now + validity,
        };
        let signature = issuer.sign(&postcard::to_allocvec(&tbs)?);
        Ok(Self { tbs, signature })
    }

    /// Issue a self-signed certificate for a key pair
    pub fn self_issue(keys: &NodeKeyPair, validity: Duration) -> CryptoResult<Self> {
        Self::issue(keys.public_bytes(), keys, validity)
    }

    pub fn subject_key(&self) -> &KeyBytes {
        &self.tbs.subject_key
    }

    pub fn issuer_key(&self) -> &KeyBytes {
        &self.tbs.issuer_key
    }

    pub fn serial(&self) -> u64 {
        self.tbs.serial
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.tbs.not_before
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.tbs.expires_at
    }

    /// The private address owned by the subject key
    pub fn subject_address(&self) -> PrivateAddress {
        PrivateAddress::derive(&self.tbs.subject_key)
    }

    pub fn is_self_signed(&self) -> bool {
        self.tbs.subject_key == self.tbs.issuer_key
    }

    /// Whether `now` falls inside the validity window
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.tbs.not_before <= now && now < self.tbs.expires_at
    }

    /// Verify the signature against the embedded issuer key
    pub fn verify(&self) -> CryptoResult<()> {
        let tbs = postcard::to_allocvec(&self.tbs)?;
        verify_signature(&self.tbs.issuer_key, &tbs, &self.signature)
    }

    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Validate a leaf-first certificate chain against a trusted key set
///
/// Every certificate must verify against its embedded issuer, be inside
/// its validity window at `now`, link to the next certificate's subject,
/// and the final issuer must be one of `trusted`.
pub fn validate_chain(
    chain: &[Certificate],
    trusted: &[KeyBytes],
    now: DateTime<Utc>,
) -> CryptoResult<()> {
    if chain.is_empty() {
        return Err(CryptoError::CertificateInvalid("empty chain".to_string()));
    }
    for cert in chain {
        cert.verify()?;
        if !cert.is_valid_at(now) {
            return Err(CryptoError::CertificateExpired);
        }
    }
    for pair in chain.windows(2) {
        if pair[0].issuer_key() != pair[1].subject_key() {
            return Err(CryptoError::CertificateInvalid(
                "broken issuer link".to_string(),
            ));
        }
    }
    let root_issuer = chain[chain.len() - 1].issuer_key();
    if trusted.contains(root_issuer) {
        Ok(())
    } else {
        Err(CryptoError::UntrustedSigner)
    }
}

/// A certificate rotation message received from the network
///
/// Carries the replacement identity certificate plus the chain proving
/// the issuer's authority. Validated before it ever reaches the
/// identity manager's setter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRotation {
    pub certificate: Certificate,
    pub chain: Vec<Certificate>,
}

impl CertificateRotation {
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_issued_verifies() {
        let keys = NodeKeyPair::generate();
        let cert = Certificate::self_issue(&keys, Duration::days(730)).unwrap();
        cert.verify().unwrap();
        assert!(cert.is_self_signed());
        assert!(cert.is_valid_at(Utc::now()));
        assert_eq!(cert.subject_address(), keys.address());
    }

    #[test]
    fn test_serialization_round_trip() {
        let keys = NodeKeyPair::generate();
        let cert = Certificate::self_issue(&keys, Duration::days(1)).unwrap();
        let restored = Certificate::from_bytes(&cert.to_bytes().unwrap()).unwrap();
        assert_eq!(cert, restored);
        restored.verify().unwrap();
    }

    #[test]
    fn test_tampered_certificate_fails() {
        let keys = NodeKeyPair::generate();
        let mut cert = Certificate::self_issue(&keys, Duration::days(1)).unwrap();
        cert.tbs.serial = cert.tbs.serial.wrapping_add(1);
        assert!(cert.verify().is_err());
    }

    #[test]
    fn test_chain_validation() {
        let root = NodeKeyPair::generate();
        let leaf_keys = NodeKeyPair::generate();
        let root_cert = Certificate::self_issue(&root, Duration::days(730)).unwrap();
        let leaf = Certificate::issue(leaf_keys.public_bytes(), &root, Duration::days(180)).unwrap();

        let chain = vec![leaf.clone(), root_cert.clone()];
        validate_chain(&chain, &[root.public_bytes()], Utc::now()).unwrap();

        // Leaf alone still roots at the trusted issuer key
        validate_chain(&[leaf.clone()], &[root.public_bytes()], Utc::now()).unwrap();

        // Untrusted root
        let stranger = NodeKeyPair::generate();
        assert!(matches!(
            validate_chain(&chain, &[stranger.public_bytes()], Utc::now()),
            Err(CryptoError::UntrustedSigner)
        ));

        // Broken link
        let unrelated = Certificate::self_issue(&stranger, Duration::days(1)).unwrap();
        assert!(validate_chain(
            &[leaf, unrelated],
            &[stranger.public_bytes()],
            Utc::now()
        )
        .is_err());
    }

    #[test]
    fn test_expired_chain_rejected() {
        let root = NodeKeyPair::generate();
        let cert = Certificate::self_issue(&root, Duration::days(1)).unwrap();
        let later = Utc::now() + Duration::days(2);
        assert!(matches!(
            validate_chain(&[cert], &[root.public_bytes()], later),
            Err(CryptoError::CertificateExpired)
        ));
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert!(validate_chain(&[], &[], Utc::now()).is_err());
    }
}
