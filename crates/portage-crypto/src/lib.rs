//! # Portage Crypto
//!
//! Cryptographic identity for the Portage gateway: the node key pair,
//! certificates and chains, the signed envelope format shared by parcels,
//! cargo and cargo collection requests, the collection-channel handshake
//! messages, and the [`IdentityManager`] that owns the certificate
//! lifecycle over an abstract credential store.
//!
//! ## Trust model
//!
//! Everything is ed25519. A node bootstraps with a self-issued identity
//! certificate and replaces it with a gateway-issued one after
//! registration; rotation only ever accepts a strictly-later expiry.
//! Endpoint certificates are issued by the node, so every local sender
//! chain roots at the node's own key; cargo from the network must root at
//! the node's key or the registered gateway's.

pub mod certificate;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod keys;

pub use certificate::{Certificate, CertificateRotation, validate_chain};
pub use envelope::{
    CargoItem, CargoItemBody, Envelope, EnvelopeKind, decode_cargo_items, encode_cargo_items,
    random_message_id,
};
pub use error::{CryptoError, CryptoResult, HandshakeError};
pub use handshake::{
    DeliveryAck, HandshakeResponse, NONCE_LEN, NonceSignature, ParcelDelivery, generate_nonce,
    verify_handshake_response,
};
pub use identity::{
    CDA_VALIDITY_DAYS, CredentialSlot, CredentialStore, IDENTITY_CERT_VALIDITY_DAYS,
    IdentityManager, MemoryCredentialStore,
};
pub use keys::{
    KeyBytes, NodeKeyPair, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE, SIGNATURE_SIZE, SecureBytes,
    verify_signature,
};
