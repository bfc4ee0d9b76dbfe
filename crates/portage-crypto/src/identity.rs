//! Identity and certificate lifecycle
//!
//! The [`IdentityManager`] owns the node's key pair and certificates over
//! an abstract [`CredentialStore`]. Everything is generated lazily on
//! first use and persisted; rotation replaces, never merges, and only
//! accepts a certificate whose expiry is strictly later than the current
//! one's. An invalid or stale rotation message is logged and discarded,
//! never partially applied.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use portage_core::PrivateAddress;

use crate::certificate::{Certificate, CertificateRotation, validate_chain};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyBytes, NodeKeyPair};

/// Validity window of a self-issued identity certificate
pub const IDENTITY_CERT_VALIDITY_DAYS: i64 = 730;

/// Validity window of a cargo delivery authorization
pub const CDA_VALIDITY_DAYS: i64 = 14;

/// Named slots in the credential store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialSlot {
    /// The node's secret key bytes
    IdentityKey,
    /// The node's identity certificate
    IdentityCertificate,
    /// Chain accompanying the identity certificate (may be empty)
    IdentityChain,
    /// Cargo delivery authorization chain
    CargoDeliveryAuth,
    /// The public gateway's certificate, stored after registration
    GatewayCertificate,
}

impl CredentialSlot {
    pub fn name(&self) -> &'static str {
        match self {
            CredentialSlot::IdentityKey => "identity_key",
            CredentialSlot::IdentityCertificate => "identity_certificate",
            CredentialSlot::IdentityChain => "identity_chain",
            CredentialSlot::CargoDeliveryAuth => "cargo_delivery_auth",
            CredentialSlot::GatewayCertificate => "gateway_certificate",
        }
    }
}

/// Secure persistence for keys and certificates
///
/// Implementations store opaque bytes per slot; interpretation belongs to
/// the identity manager.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, slot: CredentialSlot) -> CryptoResult<Option<Vec<u8>>>;
    async fn save(&self, slot: CredentialSlot, bytes: &[u8]) -> CryptoResult<()>;
    async fn delete(&self, slot: CredentialSlot) -> CryptoResult<()>;
}

/// In-memory credential store for tests and composition without disk
#[derive(Default)]
pub struct MemoryCredentialStore {
    slots: std::sync::Mutex<std::collections::HashMap<&'static str, Vec<u8>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, slot: CredentialSlot) -> CryptoResult<Option<Vec<u8>>> {
        let slots = self
            .slots
            .lock()
            .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
        Ok(slots.get(slot.name()).cloned())
    }

    async fn save(&self, slot: CredentialSlot, bytes: &[u8]) -> CryptoResult<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
        slots.insert(slot.name(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, slot: CredentialSlot) -> CryptoResult<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
        slots.remove(slot.name());
        Ok(())
    }
}

/// Owner of the node's identity material
pub struct IdentityManager<S: CredentialStore> {
    store: S,
    key: OnceCell<NodeKeyPair>,
}

impl<S: CredentialStore> IdentityManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            key: OnceCell::new(),
        }
    }

    /// Return the node key pair, generating and persisting one on first use
    pub async fn key_pair(&self) -> CryptoResult<NodeKeyPair> {
        let keys = self
            .key
            .get_or_try_init(|| async {
                match self.store.load(CredentialSlot::IdentityKey).await? {
                    Some(bytes) => NodeKeyPair::from_secret_bytes(&bytes),
                    None => {
                        let keys = NodeKeyPair::generate();
                        self.store
                            .save(CredentialSlot::IdentityKey, keys.secret_bytes().as_slice())
                            .await?;
                        info!(address = %keys.address(), "Generated node identity key pair");
                        Ok(keys)
                    }
                }
            })
            .await?;
        Ok(keys.clone())
    }

    /// The node's private address
    pub async fn node_address(&self) -> CryptoResult<PrivateAddress> {
        Ok(self.key_pair().await?.address())
    }

    /// Return the current identity certificate, synthesizing a self-issued
    /// one when none is stored or the stored one has expired
    pub async fn identity_certificate(&self) -> CryptoResult<Certificate> {
        if let Some(bytes) = self.store.load(CredentialSlot::IdentityCertificate).await? {
            let cert = Certificate::from_bytes(&bytes)?;
            if cert.is_valid_at(Utc::now()) {
                return Ok(cert);
            }
            debug!("Stored identity certificate expired, reissuing");
        }
        let keys = self.key_pair().await?;
        let cert = Certificate::self_issue(&keys, Duration::days(IDENTITY_CERT_VALIDITY_DAYS))?;
        self.store
            .save(CredentialSlot::IdentityCertificate, &cert.to_bytes()?)
            .await?;
        info!(expires_at = %cert.expires_at(), "Issued self-signed identity certificate");
        Ok(cert)
    }

    /// The identity certificate chain, leaf-first
    ///
    /// A freshly bootstrapped node has a chain of one self-issued
    /// certificate; after registration the gateway-issued chain replaces it.
    pub async fn identity_chain(&self) -> CryptoResult<Vec<Certificate>> {
        let leaf = self.identity_certificate().await?;
        let rest: Vec<Certificate> = match self.store.load(CredentialSlot::IdentityChain).await? {
            Some(bytes) => postcard::from_bytes(&bytes)?,
            None => Vec::new(),
        };
        let mut chain = vec![leaf];
        chain.extend(rest);
        Ok(chain)
    }

    /// Return the cargo delivery authorization chain, synthesizing one
    /// when none is stored or any link has expired
    pub async fn cargo_delivery_auth(&self) -> CryptoResult<Vec<Certificate>> {
        let now = Utc::now();
        if let Some(bytes) = self.store.load(CredentialSlot::CargoDeliveryAuth).await? {
            let chain: Vec<Certificate> = postcard::from_bytes(&bytes)?;
            if !chain.is_empty() && chain.iter().all(|c| c.is_valid_at(now)) {
                return Ok(chain);
            }
            debug!("Stored cargo delivery authorization expired, reissuing");
        }
        let keys = self.key_pair().await?;
        let identity = self.identity_certificate().await?;
        let delegation = Certificate::issue(
            keys.public_bytes(),
            &keys,
            Duration::days(CDA_VALIDITY_DAYS),
        )?;
        let chain = vec![delegation, identity];
        self.store
            .save(
                CredentialSlot::CargoDeliveryAuth,
                &postcard::to_allocvec(&chain)?,
            )
            .await?;
        info!("Issued cargo delivery authorization");
        Ok(chain)
    }

    /// Replace the identity certificate, only if the replacement expires
    /// strictly later than the current one
    ///
    /// Returns whether the replacement was applied.
    pub async fn set_identity_certificate(
        &self,
        new_cert: Certificate,
        chain: Vec<Certificate>,
    ) -> CryptoResult<bool> {
        let current = self.identity_certificate().await?;
        if new_cert.expires_at() <= current.expires_at() {
            debug!(
                new_expiry = %new_cert.expires_at(),
                current_expiry = %current.expires_at(),
                "Ignoring identity certificate with no later expiry"
            );
            return Ok(false);
        }
        self.store
            .save(CredentialSlot::IdentityCertificate, &new_cert.to_bytes()?)
            .await?;
        self.store
            .save(
                CredentialSlot::IdentityChain,
                &postcard::to_allocvec(&chain)?,
            )
            .await?;
        info!(expires_at = %new_cert.expires_at(), "Replaced identity certificate");
        Ok(true)
    }

    /// Validate and apply a certificate rotation message from the network
    ///
    /// The rotation must name this node's key as subject and its chain
    /// must root at one of `trusted` or at this node's own key. Invalid
    /// or stale rotations are discarded; only store failures error.
    pub async fn apply_rotation(&self, bytes: &[u8], trusted: &[KeyBytes]) -> CryptoResult<bool> {
        let rotation = match CertificateRotation::from_bytes(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Discarding malformed certificate rotation");
                return Ok(false);
            }
        };
        let keys = self.key_pair().await?;
        if rotation.certificate.subject_key() != &keys.public_bytes() {
            warn!("Discarding certificate rotation for a different subject");
            return Ok(false);
        }
        let mut anchors = vec![keys.public_bytes()];
        anchors.extend_from_slice(trusted);
        let mut full_chain = vec![rotation.certificate.clone()];
        full_chain.extend(rotation.chain.iter().cloned());
        if let Err(e) = validate_chain(&full_chain, &anchors, Utc::now()) {
            warn!(error = %e, "Discarding certificate rotation with invalid chain");
            return Ok(false);
        }
        self.set_identity_certificate(rotation.certificate, rotation.chain)
            .await
    }

    /// Store the public gateway's certificate after registration
    pub async fn set_gateway_certificate(&self, cert: &Certificate) -> CryptoResult<()> {
        self.store
            .save(CredentialSlot::GatewayCertificate, &cert.to_bytes()?)
            .await
    }

    /// The public gateway's certificate, when the node is registered
    pub async fn gateway_certificate(&self) -> CryptoResult<Option<Certificate>> {
        match self.store.load(CredentialSlot::GatewayCertificate).await? {
            Some(bytes) => Ok(Some(Certificate::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The trust anchors for cargo and rotation validation: this node's
    /// key plus the registered gateway's key
    pub async fn trust_anchors(&self) -> CryptoResult<Vec<KeyBytes>> {
        let mut anchors = vec![self.key_pair().await?.public_bytes()];
        if let Some(gateway) = self.gateway_certificate().await? {
            anchors.push(*gateway.subject_key());
        }
        Ok(anchors)
    }

    /// Sweep persisted certificates and purge any past expiry
    ///
    /// Returns the number of slots purged.
    pub async fn delete_expired_certificates(&self) -> CryptoResult<usize> {
        let now = Utc::now();
        let mut purged = 0;

        if let Some(bytes) = self.store.load(CredentialSlot::IdentityCertificate).await? {
            let cert = Certificate::from_bytes(&bytes)?;
            if !cert.is_valid_at(now) {
                self.store.delete(CredentialSlot::IdentityCertificate).await?;
                self.store.delete(CredentialSlot::IdentityChain).await?;
                purged += 1;
            }
        }
        if let Some(bytes) = self.store.load(CredentialSlot::GatewayCertificate).await? {
            let cert = Certificate::from_bytes(&bytes)?;
            if !cert.is_valid_at(now) {
                self.store.delete(CredentialSlot::GatewayCertificate).await?;
                purged += 1;
            }
        }
        if let Some(bytes) = self.store.load(CredentialSlot::CargoDeliveryAuth).await? {
            let chain: Vec<Certificate> = postcard::from_bytes(&bytes)?;
            if chain.iter().any(|c| !c.is_valid_at(now)) {
                self.store.delete(CredentialSlot::CargoDeliveryAuth).await?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "Purged expired certificates");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> IdentityManager<MemoryCredentialStore> {
        IdentityManager::new(MemoryCredentialStore::new())
    }

    #[tokio::test]
    async fn test_key_pair_is_stable() {
        let manager = manager();
        let a = manager.key_pair().await.unwrap();
        let b = manager.key_pair().await.unwrap();
        assert_eq!(a.public_bytes(), b.public_bytes());
    }

    #[tokio::test]
    async fn test_identity_certificate_lazily_issued() {
        let manager = manager();
        let cert = manager.identity_certificate().await.unwrap();
        cert.verify().unwrap();
        assert!(cert.is_self_signed());

        // Second call returns the persisted certificate, not a fresh one
        let again = manager.identity_certificate().await.unwrap();
        assert_eq!(cert.serial(), again.serial());
    }

    #[tokio::test]
    async fn test_cda_chain_roots_at_identity() {
        let manager = manager();
        let keys = manager.key_pair().await.unwrap();
        let chain = manager.cargo_delivery_auth().await.unwrap();
        validate_chain(&chain, &[keys.public_bytes()], Utc::now()).unwrap();
    }

    #[tokio::test]
    async fn test_rotation_requires_later_expiry() {
        let manager = manager();
        let keys = manager.key_pair().await.unwrap();
        let current = manager.identity_certificate().await.unwrap();

        // Strictly-later expiry: applied
        let newer = Certificate::issue(
            keys.public_bytes(),
            &keys,
            Duration::days(IDENTITY_CERT_VALIDITY_DAYS + 10),
        )
        .unwrap();
        assert!(manager
            .set_identity_certificate(newer.clone(), vec![])
            .await
            .unwrap());
        assert_eq!(
            manager.identity_certificate().await.unwrap().serial(),
            newer.serial()
        );

        // Older expiry: no-op, getter still returns the newer certificate
        let stale = Certificate::issue(keys.public_bytes(), &keys, Duration::days(1)).unwrap();
        assert!(!manager
            .set_identity_certificate(stale, vec![])
            .await
            .unwrap());
        assert_eq!(
            manager.identity_certificate().await.unwrap().serial(),
            newer.serial()
        );
        assert_ne!(current.serial(), newer.serial());
    }

    #[tokio::test]
    async fn test_stale_rotation_message_discarded() {
        let manager = manager();
        let keys = manager.key_pair().await.unwrap();
        let current = manager.identity_certificate().await.unwrap();

        let stale = Certificate::issue(keys.public_bytes(), &keys, Duration::days(1)).unwrap();
        let rotation = CertificateRotation {
            certificate: stale,
            chain: vec![],
        };
        let applied = manager
            .apply_rotation(&rotation.to_bytes().unwrap(), &[])
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(
            manager.identity_certificate().await.unwrap().serial(),
            current.serial()
        );
    }

    #[tokio::test]
    async fn test_untrusted_rotation_discarded() {
        let manager = manager();
        let keys = manager.key_pair().await.unwrap();
        manager.identity_certificate().await.unwrap();

        let impostor = NodeKeyPair::generate();
        let forged = Certificate::issue(
            keys.public_bytes(),
            &impostor,
            Duration::days(IDENTITY_CERT_VALIDITY_DAYS + 100),
        )
        .unwrap();
        let rotation = CertificateRotation {
            certificate: forged,
            chain: vec![],
        };
        let applied = manager
            .apply_rotation(&rotation.to_bytes().unwrap(), &[])
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_malformed_rotation_discarded() {
        let manager = manager();
        manager.identity_certificate().await.unwrap();
        let applied = manager.apply_rotation(b"garbage", &[]).await.unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_expired_certificate_sweep() {
        let store = MemoryCredentialStore::new();
        let keys = NodeKeyPair::generate();
        let expired = Certificate::issue(keys.public_bytes(), &keys, Duration::seconds(-1)).unwrap();
        store
            .save(
                CredentialSlot::GatewayCertificate,
                &expired.to_bytes().unwrap(),
            )
            .await
            .unwrap();

        let manager = IdentityManager::new(store);
        let purged = manager.delete_expired_certificates().await.unwrap();
        assert_eq!(purged, 1);
        assert!(manager.gateway_certificate().await.unwrap().is_none());
    }
}
