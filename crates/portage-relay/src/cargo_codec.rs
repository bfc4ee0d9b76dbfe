//! Cargo generation and processing
//!
//! `generate` batches every pending outbound parcel and collection
//! acknowledgement into sealed cargo containers bounded by a maximum
//! payload size; `process` validates an incoming container and classifies
//! each inner item: parcels go through the shared ingestion pipeline,
//! acknowledgements delete the matching outbound parcel. Per-item
//! failures never abort the container, and consumed containers are
//! deleted from staging by the caller regardless of item outcomes.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use portage_core::{CollectionRecord, NotifierEvent, ParcelKey, PrivateAddress, RecipientLocation};
use portage_crypto::{
    CargoItem, CargoItemBody, CredentialStore, Envelope, EnvelopeKind, IdentityManager,
    decode_cargo_items, encode_cargo_items, random_message_id,
};
use portage_store::{CollectionRecordStore, EndpointNotifier, ParcelStore, StoreError};

use crate::error::RelayResult;
use crate::ingestion::{CLOCK_SKEW_MINUTES, IngestOutcome, ParcelIngestor};

/// Default ceiling on one cargo container's item payload
pub const DEFAULT_MAX_CARGO_SIZE: usize = 8 * 1024 * 1024;

/// Validity window of a sealed cargo envelope
const CARGO_TTL_DAYS: i64 = 14;

/// Outcome of processing one cargo container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CargoProcessOutcome {
    /// The envelope failed validation; nothing was stored
    Rejected(String),
    /// Every item was classified and handled
    Processed {
        stored: usize,
        acked: usize,
        skipped: usize,
    },
}

/// Batches parcels into cargo and unpacks cargo back into the store
pub struct CargoCodec<S: CredentialStore> {
    parcels: Arc<ParcelStore>,
    records: Arc<CollectionRecordStore>,
    identity: Arc<IdentityManager<S>>,
    ingestor: Arc<ParcelIngestor>,
    notifier: EndpointNotifier,
    max_cargo_size: usize,
}

impl<S: CredentialStore> CargoCodec<S> {
    pub fn new(
        parcels: Arc<ParcelStore>,
        records: Arc<CollectionRecordStore>,
        identity: Arc<IdentityManager<S>>,
        ingestor: Arc<ParcelIngestor>,
        notifier: EndpointNotifier,
        max_cargo_size: usize,
    ) -> Self {
        Self {
            parcels,
            records,
            identity,
            ingestor,
            notifier,
            max_cargo_size,
        }
    }

    /// Seal every pending outbound parcel and acknowledgement into zero
    /// or more cargo containers addressed to `gateway_address`
    pub async fn generate(&self, gateway_address: &str) -> RelayResult<Vec<Vec<u8>>> {
        let now = Utc::now();
        let mut items = Vec::new();

        for parcel in self
            .parcels
            .list_for_location(RecipientLocation::ExternalGateway)
            .await?
        {
            if parcel.is_expired_at(now) {
                self.parcels.delete(&parcel.key()).await?;
                continue;
            }
            let blob = match self.parcels.load_blob(&parcel).await {
                Ok(bytes) => bytes,
                Err(StoreError::BlobMissing(_)) => {
                    // Unrecoverable: drop the dangling metadata
                    warn!(key = %parcel.key(), "Dropping parcel with missing blob");
                    self.parcels.delete(&parcel.key()).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            items.push(CargoItem {
                expires_at: parcel.expires_at,
                body: CargoItemBody::Parcel(blob.to_vec()),
            });
        }

        for record in self.records.list_pending(now).await? {
            items.push(CargoItem {
                expires_at: record.expires_at,
                body: CargoItemBody::CollectionAck {
                    recipient: record.recipient,
                    sender: record.sender,
                    message_id: record.message_id,
                },
            });
        }

        if items.is_empty() {
            return Ok(Vec::new());
        }

        let keys = self.identity.key_pair().await?;
        let chain = self.identity.identity_chain().await?;
        let mut containers = Vec::new();
        let mut batch: Vec<CargoItem> = Vec::new();
        let mut batch_size = 0usize;

        for item in items {
            let len = item.encoded_len()?;
            if !batch.is_empty() && batch_size + len > self.max_cargo_size {
                containers.push(self.seal_container(&batch, gateway_address, &chain, &keys)?);
                batch.clear();
                batch_size = 0;
            }
            batch_size += len;
            batch.push(item);
        }
        if !batch.is_empty() {
            containers.push(self.seal_container(&batch, gateway_address, &chain, &keys)?);
        }

        info!(
            containers = containers.len(),
            gateway = gateway_address,
            "Generated cargo"
        );
        Ok(containers)
    }

    fn seal_container(
        &self,
        items: &[CargoItem],
        gateway_address: &str,
        chain: &[portage_crypto::Certificate],
        keys: &portage_crypto::NodeKeyPair,
    ) -> RelayResult<Vec<u8>> {
        let envelope = Envelope::seal(
            EnvelopeKind::Cargo,
            gateway_address,
            random_message_id(),
            Duration::days(CARGO_TTL_DAYS),
            encode_cargo_items(items)?,
            chain.to_vec(),
            keys,
        )?;
        Ok(envelope.to_bytes()?)
    }

    /// Validate and unpack one cargo container
    pub async fn process(&self, cargo_bytes: &[u8]) -> RelayResult<CargoProcessOutcome> {
        let now = Utc::now();
        let envelope = match Envelope::from_bytes(cargo_bytes) {
            Ok(e) if e.kind() == EnvelopeKind::Cargo => e,
            Ok(_) | Err(_) => {
                return Ok(CargoProcessOutcome::Rejected("malformed cargo".to_string()));
            }
        };

        let anchors = self.identity.trust_anchors().await?;
        if let Err(e) = envelope.verify_sender(&anchors, now, Duration::minutes(CLOCK_SKEW_MINUTES))
        {
            warn!(error = %e, "Rejecting unauthorized cargo");
            return Ok(CargoProcessOutcome::Rejected(
                "unauthorized sender".to_string(),
            ));
        }
        let items = match decode_cargo_items(envelope.payload()) {
            Ok(items) => items,
            Err(_) => {
                return Ok(CargoProcessOutcome::Rejected(
                    "malformed cargo payload".to_string(),
                ));
            }
        };

        let mut stored = 0;
        let mut acked = 0;
        let mut skipped = 0;
        for item in items {
            if item.is_expired_at(now) {
                skipped += 1;
                continue;
            }
            match item.body {
                CargoItemBody::Parcel(raw) => {
                    match self
                        .ingestor
                        .ingest(&raw, RecipientLocation::LocalEndpoint)
                        .await?
                    {
                        IngestOutcome::Success(parcel) => {
                            stored += 1;
                            self.record_receipt(
                                &parcel.recipient,
                                &parcel.sender,
                                &parcel.message_id,
                                parcel.expires_at,
                            )
                            .await?;
                            if let Ok(recipient) = PrivateAddress::parse(&parcel.recipient) {
                                self.notifier.notify(NotifierEvent::ParcelArrived { recipient });
                            }
                        }
                        // The sender still deserves a receipt so it stops
                        // resending a parcel this node will never accept
                        IngestOutcome::Invalid(descriptor) => {
                            skipped += 1;
                            self.record_receipt(
                                &descriptor.recipient,
                                &descriptor.sender,
                                &descriptor.message_id,
                                descriptor.expires_at,
                            )
                            .await?;
                        }
                        outcome => {
                            debug!(?outcome, "Skipping cargo parcel");
                            skipped += 1;
                        }
                    }
                }
                CargoItemBody::CollectionAck {
                    sender, message_id, ..
                } => {
                    // Unknown ids are a silent no-op
                    if self
                        .parcels
                        .delete(&ParcelKey::new(sender, message_id))
                        .await?
                    {
                        acked += 1;
                    }
                }
            }
        }

        info!(stored, acked, skipped, "Processed cargo container");
        Ok(CargoProcessOutcome::Processed {
            stored,
            acked,
            skipped,
        })
    }

    async fn record_receipt(
        &self,
        recipient: &str,
        sender: &str,
        message_id: &str,
        expires_at: chrono::DateTime<Utc>,
    ) -> RelayResult<()> {
        self.records
            .insert(CollectionRecord {
                recipient: recipient.to_string(),
                sender: sender.to_string(),
                message_id: message_id.to_string(),
                created_at: Utc::now(),
                expires_at,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portage_crypto::{Certificate, MemoryCredentialStore, NodeKeyPair};
    use portage_store::Db;
    use tempfile::TempDir;

    struct Fixture {
        codec: CargoCodec<MemoryCredentialStore>,
        parcels: Arc<ParcelStore>,
        records: Arc<CollectionRecordStore>,
        identity: Arc<IdentityManager<MemoryCredentialStore>>,
        _temp: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let db = Db::open(&temp.path().join("gateway.redb")).unwrap();
        let parcels = Arc::new(
            ParcelStore::open(db.clone(), temp.path().join("blobs"))
                .await
                .unwrap(),
        );
        let records = Arc::new(CollectionRecordStore::new(db));
        let identity = Arc::new(IdentityManager::new(MemoryCredentialStore::new()));
        let node_key = identity.key_pair().await.unwrap().public_bytes();
        let ingestor = Arc::new(ParcelIngestor::new(
            parcels.clone(),
            records.clone(),
            node_key,
        ));
        let codec = CargoCodec::new(
            parcels.clone(),
            records.clone(),
            identity.clone(),
            ingestor,
            EndpointNotifier::new(),
            DEFAULT_MAX_CARGO_SIZE,
        );
        Fixture {
            codec,
            parcels,
            records,
            identity,
            _temp: temp,
        }
    }

    async fn outbound_parcel(f: &Fixture, message_id: &str) -> Vec<u8> {
        let node = f.identity.key_pair().await.unwrap();
        let endpoint = NodeKeyPair::generate();
        let chain = vec![
            Certificate::issue(endpoint.public_bytes(), &node, Duration::days(180)).unwrap(),
        ];
        let recipient = PrivateAddress::derive(&rand::random::<[u8; 32]>());
        let raw = Envelope::seal(
            EnvelopeKind::Parcel,
            recipient.as_str(),
            message_id,
            Duration::hours(6),
            b"ciphertext".to_vec(),
            chain,
            &endpoint,
        )
        .unwrap()
        .to_bytes()
        .unwrap();

        let key = ParcelKey::new(endpoint.address().as_str(), message_id);
        let stored = portage_core::StoredParcel {
            recipient: recipient.as_str().to_string(),
            sender: endpoint.address().as_str().to_string(),
            message_id: message_id.to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(6),
            blob_name: ParcelStore::blob_name(&key),
            size: raw.len() as u64,
            location: RecipientLocation::ExternalGateway,
        };
        f.parcels.insert(stored, &raw).await.unwrap();
        raw
    }

    #[tokio::test]
    async fn test_empty_pending_set_yields_no_containers() {
        let f = fixture().await;
        assert!(f.codec.generate("gw").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generate_then_process_round_trip() {
        let f = fixture().await;
        outbound_parcel(&f, "m-1").await;
        outbound_parcel(&f, "m-2").await;

        let containers = f.codec.generate("gw").await.unwrap();
        assert_eq!(containers.len(), 1);

        // Processing the node's own cargo re-ingests both parcels as
        // inbound and records a receipt for each
        let outcome = f.codec.process(&containers[0]).await.unwrap();
        assert_eq!(
            outcome,
            CargoProcessOutcome::Processed {
                stored: 2,
                acked: 0,
                skipped: 0,
            }
        );
        assert_eq!(
            f.parcels
                .list_for_location(RecipientLocation::LocalEndpoint)
                .await
                .unwrap()
                .len(),
            2
        );
        assert_eq!(f.records.list_pending(Utc::now()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_acks_delete_outbound_parcels_idempotently() {
        let f = fixture().await;
        outbound_parcel(&f, "m-1").await;
        let outbound = f
            .parcels
            .list_for_location(RecipientLocation::ExternalGateway)
            .await
            .unwrap();
        let target = &outbound[0];

        let keys = f.identity.key_pair().await.unwrap();
        let chain = f.identity.identity_chain().await.unwrap();
        let items = vec![CargoItem {
            expires_at: Utc::now() + Duration::hours(1),
            body: CargoItemBody::CollectionAck {
                recipient: target.recipient.clone(),
                sender: target.sender.clone(),
                message_id: target.message_id.clone(),
            },
        }];
        let cargo = Envelope::seal(
            EnvelopeKind::Cargo,
            "self",
            "c-1",
            Duration::days(1),
            encode_cargo_items(&items).unwrap(),
            chain,
            &keys,
        )
        .unwrap()
        .to_bytes()
        .unwrap();

        let first = f.codec.process(&cargo).await.unwrap();
        assert_eq!(
            first,
            CargoProcessOutcome::Processed {
                stored: 0,
                acked: 1,
                skipped: 0,
            }
        );
        // Second pass: unknown id, silent no-op
        let second = f.codec.process(&cargo).await.unwrap();
        assert_eq!(
            second,
            CargoProcessOutcome::Processed {
                stored: 0,
                acked: 0,
                skipped: 0,
            }
        );
        assert!(f
            .parcels
            .list_for_location(RecipientLocation::ExternalGateway)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_cargo_rejected() {
        let f = fixture().await;
        let stranger = NodeKeyPair::generate();
        let chain = vec![Certificate::self_issue(&stranger, Duration::days(1)).unwrap()];
        let cargo = Envelope::seal(
            EnvelopeKind::Cargo,
            "self",
            "c-1",
            Duration::days(1),
            encode_cargo_items(&[]).unwrap(),
            chain,
            &stranger,
        )
        .unwrap()
        .to_bytes()
        .unwrap();

        assert!(matches!(
            f.codec.process(&cargo).await.unwrap(),
            CargoProcessOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_malformed_cargo_rejected() {
        let f = fixture().await;
        assert!(matches!(
            f.codec.process(b"junk").await.unwrap(),
            CargoProcessOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_oversized_pending_set_splits_containers() {
        let f = fixture().await;
        // Rebuild the codec with a tiny ceiling so two parcels overflow
        let small = CargoCodec::new(
            f.parcels.clone(),
            f.records.clone(),
            f.identity.clone(),
            Arc::new(ParcelIngestor::new(
                f.parcels.clone(),
                f.records.clone(),
                f.identity.key_pair().await.unwrap().public_bytes(),
            )),
            EndpointNotifier::new(),
            600,
        );
        outbound_parcel(&f, "m-1").await;
        outbound_parcel(&f, "m-2").await;

        let containers = small.generate("gw").await.unwrap();
        assert_eq!(containers.len(), 2);
    }
}
