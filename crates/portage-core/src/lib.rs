//! # Portage Core
//!
//! Shared types for the Portage private gateway: node and endpoint
//! addressing, parcel metadata, collection receipts, and the event types
//! the gateway components publish to each other.
//!
//! This crate is the leaf of the workspace — everything else depends on
//! it, it depends on nothing but serialization and hashing utilities.
//!
//! ## Addressing
//!
//! Nodes and local endpoints are identified by a *private address*: the
//! string `0` followed by the hex encoding of the first 20 bytes of the
//! BLAKE3 digest of the ed25519 public key. External gateways use opaque
//! non-private addresses (typically `host:port`).
//!
//! ## Parcels
//!
//! A parcel's stored form is metadata only — the sealed bytes live in a
//! blob file next to the database. The `(sender, message_id)` pair is the
//! primary key everywhere: a sender can never have two live parcels with
//! the same id.

pub mod address;
pub mod error;
pub mod events;
pub mod parcel;

pub use address::{PrivateAddress, is_private_form};
pub use error::{AddressError, PortageError, PortageResult};
pub use events::{ConnectionState, NotifierEvent, RegistrationState};
pub use parcel::{
    CollectionRecord, LocalEndpoint, PARCEL_CONTENT_TYPE, ParcelKey, RecipientLocation,
    StoredParcel,
};
