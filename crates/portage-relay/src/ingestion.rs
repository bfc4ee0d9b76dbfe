//! The shared parcel ingestion pipeline
//!
//! Every parcel entering the store — local submission, public
//! collection, cargo processing — goes through [`ParcelIngestor::ingest`].
//! The steps run in a fixed order and any failure short-circuits with a
//! typed outcome:
//!
//! 1. deserialize (`Malformed`)
//! 2. local-destination recipients must be of private form
//!    (`InvalidRecipient`)
//! 3. signature, validity window, and per-destination chain rules
//!    (`Invalid`)
//! 4. duplicate check against stored parcels and collection receipts
//!    (`Duplicate`)
//! 5. persist blob then metadata (`Success`)
//!
//! Destination rules: both destinations require a verifying signature and
//! a live validity window; outbound parcels (local submissions) must
//! additionally chain to this node's identity key, since only endpoints
//! this node registered may relay outward.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use portage_core::{ParcelKey, RecipientLocation, StoredParcel, is_private_form};
use portage_crypto::{Envelope, EnvelopeKind, KeyBytes};
use portage_store::{CollectionRecordStore, ParcelStore};

use crate::error::RelayResult;

/// Forward clock-skew allowance on a parcel's creation time
pub const CLOCK_SKEW_MINUTES: i64 = 10;

/// Identifying fields of a parcel that failed validation
///
/// Cargo processing still owes the sender a receipt for an invalid
/// parcel, so the outcome carries enough to write one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParcelDescriptor {
    pub recipient: String,
    pub sender: String,
    pub message_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of one ingestion attempt
///
/// Consumers match exhaustively; only `Success` (and, for cargo-origin
/// parcels, `Invalid`) triggers downstream side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored; the metadata row is returned
    Success(StoredParcel),
    /// Undecodable bytes; rejected, never retried
    Malformed,
    /// A local-destination parcel naming a non-private recipient
    InvalidRecipient,
    /// Well-formed but failed signature, window, or chain validation
    Invalid(ParcelDescriptor),
    /// An identical (sender, id) parcel is stored or already receipted
    Duplicate,
}

/// The shared ingestion pipeline
pub struct ParcelIngestor {
    parcels: Arc<ParcelStore>,
    records: Arc<CollectionRecordStore>,
    /// Trust root for outbound sender chains: this node's identity key
    relay_trust_root: KeyBytes,
}

impl ParcelIngestor {
    pub fn new(
        parcels: Arc<ParcelStore>,
        records: Arc<CollectionRecordStore>,
        relay_trust_root: KeyBytes,
    ) -> Self {
        Self {
            parcels,
            records,
            relay_trust_root,
        }
    }

    /// Run the pipeline on raw parcel bytes
    pub async fn ingest(
        &self,
        raw: &[u8],
        destination: RecipientLocation,
    ) -> RelayResult<IngestOutcome> {
        let now = Utc::now();
        let skew = Duration::minutes(CLOCK_SKEW_MINUTES);

        // 1. Deserialize
        let envelope = match Envelope::from_bytes(raw) {
            Ok(e) if e.kind() == EnvelopeKind::Parcel => e,
            Ok(_) | Err(_) => {
                debug!(destination = ?destination, "Rejecting malformed parcel");
                return Ok(IngestOutcome::Malformed);
            }
        };
        let sender = match envelope.sender_address() {
            Ok(address) => address.as_str().to_string(),
            Err(_) => return Ok(IngestOutcome::Malformed),
        };
        let descriptor = ParcelDescriptor {
            recipient: envelope.recipient().to_string(),
            sender: sender.clone(),
            message_id: envelope.message_id().to_string(),
            expires_at: envelope.expires_at(),
        };

        // 2. Local destinations require private-form recipients
        if destination == RecipientLocation::LocalEndpoint
            && !is_private_form(envelope.recipient())
        {
            debug!(recipient = envelope.recipient(), "Rejecting non-private recipient");
            return Ok(IngestOutcome::InvalidRecipient);
        }

        // 3. Validate per destination rules
        let valid = match destination {
            RecipientLocation::LocalEndpoint => envelope.verify(now, skew).is_ok(),
            RecipientLocation::ExternalGateway => envelope
                .verify_sender(&[self.relay_trust_root], now, skew)
                .is_ok(),
        };
        if !valid {
            debug!(key = %ParcelKey::new(&descriptor.sender, &descriptor.message_id),
                   "Rejecting invalid parcel");
            return Ok(IngestOutcome::Invalid(descriptor));
        }

        // 4. Duplicate check: live parcels and collection receipts
        let key = ParcelKey::new(sender.clone(), envelope.message_id());
        if self.parcels.contains(&key).await?
            || self
                .records
                .contains(envelope.recipient(), &sender, envelope.message_id())
                .await?
        {
            debug!(key = %key, "Dropping duplicate parcel");
            return Ok(IngestOutcome::Duplicate);
        }

        // 5. Persist, blob before metadata
        let parcel = StoredParcel {
            recipient: envelope.recipient().to_string(),
            sender,
            message_id: envelope.message_id().to_string(),
            created_at: envelope.created_at(),
            expires_at: envelope.expires_at(),
            blob_name: ParcelStore::blob_name(&key),
            size: raw.len() as u64,
            location: destination,
        };
        self.parcels.insert(parcel.clone(), raw).await?;
        Ok(IngestOutcome::Success(parcel))
    }
}
