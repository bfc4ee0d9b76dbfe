//! Signed envelopes: the shared container for parcels, cargo and cargo
//! collection requests
//!
//! An envelope is the postcard encoding of its to-be-signed fields plus a
//! detached ed25519 signature by the leaf subject of the embedded sender
//! chain. Parcels carry opaque end-to-end encrypted payloads; cargo
//! payloads are an ordered batch of [`CargoItem`]s, each with an expiry
//! independent of the envelope's; a cargo collection request's payload is
//! the CDA delegation chain authorizing the remote side to hand cargo back.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use portage_core::PrivateAddress;

use crate::certificate::{Certificate, validate_chain};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyBytes, NodeKeyPair, verify_signature};

/// What an envelope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// A single end-to-end encrypted user message
    Parcel,
    /// A batch of parcels and collection acknowledgements for a courier
    Cargo,
    /// A CDA-bearing request authorizing cargo collection
    CargoCollectionRequest,
}

/// Fields covered by the envelope signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TbsEnvelope {
    kind: EnvelopeKind,
    recipient: String,
    message_id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    payload: Vec<u8>,
    sender_chain: Vec<Certificate>,
}

/// A sealed, signed message container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    tbs: TbsEnvelope,
    signature: Vec<u8>,
}

impl Envelope {
    /// Seal a payload into a signed envelope
    ///
    /// `signer` must be the key pair of the leaf certificate in
    /// `sender_chain`, or verification will fail on the receiving side.
    pub fn seal(
        kind: EnvelopeKind,
        recipient: impl Into<String>,
        message_id: impl Into<String>,
        ttl: Duration,
        payload: Vec<u8>,
        sender_chain: Vec<Certificate>,
        signer: &NodeKeyPair,
    ) -> CryptoResult<Self> {
        let now = Utc::now();
        let tbs = TbsEnvelope {
            kind,
            recipient: recipient.into(),
            message_id: message_id.into(),
            created_at: now,
            expires_at: now + ttl,
            payload,
            sender_chain,
        };
        let signature = signer.sign(&postcard::to_allocvec(&tbs)?);
        Ok(Self { tbs, signature })
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.tbs.kind
    }

    pub fn recipient(&self) -> &str {
        &self.tbs.recipient
    }

    pub fn message_id(&self) -> &str {
        &self.tbs.message_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.tbs.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.tbs.expires_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.tbs.payload
    }

    pub fn sender_chain(&self) -> &[Certificate] {
        &self.tbs.sender_chain
    }

    /// The sender's private address, derived from the leaf subject key
    pub fn sender_address(&self) -> CryptoResult<PrivateAddress> {
        let leaf = self
            .tbs
            .sender_chain
            .first()
            .ok_or_else(|| CryptoError::CertificateInvalid("empty sender chain".to_string()))?;
        Ok(leaf.subject_address())
    }

    /// Verify the envelope signature and its own validity window
    ///
    /// `skew` is the forward clock-skew allowance on `created_at`.
    /// Chain trust is a separate concern — see [`Envelope::verify_sender`].
    pub fn verify(&self, now: DateTime<Utc>, skew: Duration) -> CryptoResult<()> {
        let leaf = self
            .tbs
            .sender_chain
            .first()
            .ok_or_else(|| CryptoError::CertificateInvalid("empty sender chain".to_string()))?;
        let tbs = postcard::to_allocvec(&self.tbs)?;
        verify_signature(leaf.subject_key(), &tbs, &self.signature)?;
        if self.tbs.created_at > now + skew {
            return Err(CryptoError::CertificateInvalid(
                "created in the future".to_string(),
            ));
        }
        if self.tbs.expires_at <= now {
            return Err(CryptoError::CertificateExpired);
        }
        Ok(())
    }

    /// Verify the signature, the validity window, and that the sender
    /// chain roots at one of `trusted`
    pub fn verify_sender(
        &self,
        trusted: &[KeyBytes],
        now: DateTime<Utc>,
        skew: Duration,
    ) -> CryptoResult<()> {
        self.verify(now, skew)?;
        validate_chain(&self.tbs.sender_chain, trusted, now)
    }

    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Generate a fresh random message id for a sealed envelope
pub fn random_message_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// One entry inside a cargo payload
///
/// Items expire independently of the cargo envelope; an expired item is
/// skipped during processing even when the envelope is still live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoItem {
    pub expires_at: DateTime<Utc>,
    pub body: CargoItemBody,
}

/// The two things a cargo container can carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CargoItemBody {
    /// A sealed parcel envelope, verbatim
    Parcel(Vec<u8>),
    /// Acknowledgement that a parcel was collected at the far side
    CollectionAck {
        recipient: String,
        sender: String,
        message_id: String,
    },
}

impl CargoItem {
    /// Encoded size of this item inside a cargo payload
    pub fn encoded_len(&self) -> CryptoResult<usize> {
        Ok(postcard::to_allocvec(self)?.len())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Encode a batch of cargo items as a cargo envelope payload
pub fn encode_cargo_items(items: &[CargoItem]) -> CryptoResult<Vec<u8>> {
    Ok(postcard::to_allocvec(items)?)
}

/// Decode a cargo envelope payload back into its items
pub fn decode_cargo_items(payload: &[u8]) -> CryptoResult<Vec<CargoItem>> {
    Ok(postcard::from_bytes(payload)?)
}
