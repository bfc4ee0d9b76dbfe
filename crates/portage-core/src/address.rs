//! Private address derivation and validation
//!
//! A private address binds a node or endpoint to its ed25519 public key:
//! `0` + hex(first 20 bytes of blake3(key)). The leading `0` marks the
//! local-address form; anything else is treated as an external gateway
//! address.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// Marker prefix for the private address form
pub const PRIVATE_ADDRESS_PREFIX: char = '0';

/// Bytes of the key digest carried in an address
const ADDRESS_DIGEST_LEN: usize = 20;

/// Total length of a private address string: prefix + hex digest
pub const PRIVATE_ADDRESS_LEN: usize = 1 + ADDRESS_DIGEST_LEN * 2;

/// Address of a node or locally registered endpoint
///
/// Guaranteed well-formed on construction. Use [`PrivateAddress::derive`]
/// to compute one from a public key and [`PrivateAddress::parse`] to
/// validate an externally supplied string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PrivateAddress(String);

impl PrivateAddress {
    /// Derive the address owned by a public key
    pub fn derive(public_key_bytes: &[u8]) -> Self {
        let digest = blake3::hash(public_key_bytes);
        let mut out = String::with_capacity(PRIVATE_ADDRESS_LEN);
        out.push(PRIVATE_ADDRESS_PREFIX);
        out.push_str(&hex::encode(&digest.as_bytes()[..ADDRESS_DIGEST_LEN]));
        Self(out)
    }

    /// Validate and wrap an externally supplied address string
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        if !is_private_form(raw) {
            return Err(AddressError::NotPrivateForm(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// The address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrivateAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PrivateAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PrivateAddress> for String {
    fn from(value: PrivateAddress) -> Self {
        value.0
    }
}

impl AsRef<str> for PrivateAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Check whether a string has the private (local) address form
///
/// This is the recipient gate used by parcel ingestion: parcels bound for
/// a local endpoint must name a recipient of this shape.
pub fn is_private_form(raw: &str) -> bool {
    raw.len() == PRIVATE_ADDRESS_LEN
        && raw.starts_with(PRIVATE_ADDRESS_PREFIX)
        && raw[1..].bytes().all(|b| b.is_ascii_hexdigit())
}
