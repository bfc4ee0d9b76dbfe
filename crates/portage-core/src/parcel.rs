//! Stored parcel metadata and related records
//!
//! The store keeps parcel *metadata* in the record store and the sealed
//! parcel bytes in a blob file; `StoredParcel` is the metadata row. The
//! `(sender, message_id)` pair is the primary key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::PrivateAddress;

/// Content type of a serialized parcel on every HTTP surface
pub const PARCEL_CONTENT_TYPE: &str = "application/vnd.portage.parcel";

/// Which side of the relay a stored parcel is waiting on
///
/// Partitions the parcel store: `LocalEndpoint` parcels are inbound and
/// wait for a local application to collect them; `ExternalGateway`
/// parcels are outbound and wait for the public sync engine or a cargo
/// run to carry them upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecipientLocation {
    /// Addressed to an application registered on this node
    LocalEndpoint,
    /// Addressed beyond this node; to be relayed via the internet gateway
    ExternalGateway,
}

/// Primary key of a stored parcel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParcelKey {
    pub sender: String,
    pub message_id: String,
}

impl ParcelKey {
    pub fn new(sender: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            message_id: message_id.into(),
        }
    }

    /// Unambiguous byte encoding for use as a record-store key
    ///
    /// The sender is length-prefixed so `("ab", "c")` and `("a", "bc")`
    /// can never collide.
    pub fn storage_bytes(&self) -> Vec<u8> {
        encode_parts(&[self.sender.as_bytes(), self.message_id.as_bytes()])
    }
}

impl std::fmt::Display for ParcelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.sender, self.message_id)
    }
}

/// Metadata row for one stored parcel
///
/// Immutable once written; replaced wholesale when a sender reuses a
/// message id. `blob_name` is the file name of the sealed bytes inside
/// the blob directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredParcel {
    pub recipient: String,
    pub sender: String,
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub blob_name: String,
    pub size: u64,
    pub location: RecipientLocation,
}

impl StoredParcel {
    /// The parcel's primary key
    pub fn key(&self) -> ParcelKey {
        ParcelKey::new(self.sender.clone(), self.message_id.clone())
    }

    /// Whether the parcel's own expiry has passed
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Receipt of a parcel already acknowledged to its sender via cargo
///
/// Keeping these prevents re-processing a parcel whose acknowledgement
/// already went out: the duplicate check during ingestion consults this
/// table as well as the live parcel table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub recipient: String,
    pub sender: String,
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CollectionRecord {
    /// Unambiguous byte encoding for use as a record-store key
    pub fn storage_bytes(&self) -> Vec<u8> {
        Self::key_bytes(&self.recipient, &self.sender, &self.message_id)
    }

    /// Key encoding for lookups without constructing a full record
    pub fn key_bytes(recipient: &str, sender: &str, message_id: &str) -> Vec<u8> {
        encode_parts(&[
            recipient.as_bytes(),
            sender.as_bytes(),
            message_id.as_bytes(),
        ])
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A locally registered application endpoint
///
/// Unique by address; one application may own several endpoint addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEndpoint {
    pub address: PrivateAddress,
    pub application_id: String,
}

/// Length-prefix each part so concatenation is injective
fn encode_parts(parts: &[&[u8]]) -> Vec<u8> {
    let total: usize = parts.iter().map(|p| p.len() + 4).sum();
    let mut out = Vec::with_capacity(total);
    for part in parts {
        out.extend_from_slice(&(part.len() as u32).to_le_bytes());
        out.extend_from_slice(part);
    }
    out
}
