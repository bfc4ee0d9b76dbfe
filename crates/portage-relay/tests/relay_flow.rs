//! End-to-end relay flows over the in-memory gateway double
//!
//! Each test stands up one or two full node stacks (redb store, identity
//! manager, ingestion, sync engine) and drives them the way the
//! supervisor would, asserting on what lands in the stores and on disk.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use portage_core::RecipientLocation;
use portage_crypto::{IdentityManager, MemoryCredentialStore};
use portage_relay::mock::{MockGateway, seal_endpoint_parcel};
use portage_relay::{IngestOutcome, ParcelIngestor, PublicSyncEngine, SyncMode};
use portage_store::{CollectionRecordStore, Db, EndpointNotifier, NodeConfigStore, ParcelStore};

struct Node {
    engine: PublicSyncEngine<MemoryCredentialStore>,
    parcels: Arc<ParcelStore>,
    ingestor: Arc<ParcelIngestor>,
    identity: Arc<IdentityManager<MemoryCredentialStore>>,
    temp: TempDir,
}

async fn node(gateway: Arc<MockGateway>) -> Node {
    let temp = TempDir::new().unwrap();
    let db = Db::open(&temp.path().join("gateway.redb")).unwrap();
    let parcels = Arc::new(
        ParcelStore::open(db.clone(), temp.path().join("blobs"))
            .await
            .unwrap(),
    );
    let records = Arc::new(CollectionRecordStore::new(db.clone()));
    let config = Arc::new(NodeConfigStore::new(db));
    let identity = Arc::new(IdentityManager::new(MemoryCredentialStore::new()));
    let node_key = identity.key_pair().await.unwrap().public_bytes();
    let ingestor = Arc::new(ParcelIngestor::new(parcels.clone(), records, node_key));
    let engine = PublicSyncEngine::new(
        parcels.clone(),
        identity.clone(),
        config,
        ingestor.clone(),
        gateway,
        EndpointNotifier::new(),
    );
    Node {
        engine,
        parcels,
        ingestor,
        identity,
        temp,
    }
}

async fn queue_outbound(node: &Node, message_id: &str) {
    let keys = node.identity.key_pair().await.unwrap();
    let raw = seal_endpoint_parcel(&keys, message_id);
    let outcome = node
        .ingestor
        .ingest(&raw, RecipientLocation::ExternalGateway)
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Success(_)));
}

fn blob_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_delivery_drains_queue_and_blobs() {
    let gateway = Arc::new(MockGateway::new());
    let node = node(gateway.clone()).await;
    for i in 0..3 {
        queue_outbound(&node, &format!("m-{i}")).await;
    }
    let blobs = node.temp.path().join("blobs");
    assert_eq!(blob_count(&blobs), 3);

    node.engine
        .deliver(SyncMode::OneShot, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(gateway.delivered().len(), 3);
    assert!(node
        .parcels
        .list_for_location(RecipientLocation::ExternalGateway)
        .await
        .unwrap()
        .is_empty());
    // Delivered parcels leave nothing behind on disk
    assert_eq!(blob_count(&blobs), 0);
}

#[tokio::test]
async fn test_parcel_round_trip_between_nodes() {
    let gateway = Arc::new(MockGateway::new());
    let sender = node(gateway.clone()).await;
    let receiver = node(gateway.clone()).await;

    queue_outbound(&sender, "m-1").await;
    queue_outbound(&sender, "m-2").await;
    sender
        .engine
        .deliver(SyncMode::OneShot, &CancellationToken::new())
        .await
        .unwrap();

    // The gateway routes what the sender delivered to the receiver
    for (i, parcel) in gateway.delivered().into_iter().enumerate() {
        gateway.hold_parcel(&format!("d-{i}"), parcel);
    }
    receiver
        .engine
        .collect(SyncMode::OneShot, &CancellationToken::new())
        .await
        .unwrap();

    let inbound = receiver
        .parcels
        .list_for_location(RecipientLocation::LocalEndpoint)
        .await
        .unwrap();
    assert_eq!(inbound.len(), 2);
    // Payload bytes survive the trip intact
    for parcel in &inbound {
        let blob = receiver.parcels.load_blob(parcel).await.unwrap();
        let envelope = portage_crypto::Envelope::from_bytes(&blob).unwrap();
        assert_eq!(envelope.payload(), b"ciphertext");
    }
    assert_eq!(gateway.acked().len(), 2);
}

#[tokio::test]
async fn test_recollection_is_acked_without_a_second_copy() {
    let gateway = Arc::new(MockGateway::new());
    let receiver = node(gateway.clone()).await;

    let keys = receiver.identity.key_pair().await.unwrap();
    let raw = seal_endpoint_parcel(&keys, "m-1");
    gateway.hold_parcel("d-1", raw.clone());
    receiver
        .engine
        .collect(SyncMode::OneShot, &CancellationToken::new())
        .await
        .unwrap();

    // The gateway serves the same parcel again in a later session
    gateway.hold_parcel("d-2", raw);
    receiver
        .engine
        .collect(SyncMode::OneShot, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        receiver
            .parcels
            .list_for_location(RecipientLocation::LocalEndpoint)
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(gateway.acked().len(), 2);
}
