//! Control API integration tests over a real listener
//!
//! Each test boots the full router on an ephemeral loopback port and
//! drives it with reqwest and a real WebSocket client, the way a local
//! application would.

use std::sync::Arc;

use chrono::Duration;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tempfile::TempDir;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;

use portage_core::{
    NotifierEvent, PARCEL_CONTENT_TYPE, PrivateAddress, RecipientLocation, RegistrationState,
};
use portage_crypto::{
    Certificate, DeliveryAck, Envelope, EnvelopeKind, HandshakeResponse, IdentityManager,
    MemoryCredentialStore, NodeKeyPair, NonceSignature, ParcelDelivery, validate_chain,
};
use portage_relay::{IngestOutcome, KEEP_ALIVE_HEADER, ParcelIngestor};
use portage_server::{AppState, serve};
use portage_store::{
    CollectionRecordStore, Db, EndpointNotifier, EndpointRegistry, NodeConfigStore, ParcelStore,
};

struct TestServer {
    base_url: String,
    state: Arc<AppState<MemoryCredentialStore>>,
    http: reqwest::Client,
    _shutdown: CancellationToken,
    _temp: TempDir,
}

async fn boot(registered: bool) -> TestServer {
    let temp = TempDir::new().unwrap();
    let db = Db::open(&temp.path().join("gateway.redb")).unwrap();
    let parcels = Arc::new(
        ParcelStore::open(db.clone(), temp.path().join("blobs"))
            .await
            .unwrap(),
    );
    let records = Arc::new(CollectionRecordStore::new(db.clone()));
    let endpoints = Arc::new(EndpointRegistry::new(db.clone()));
    let config = Arc::new(NodeConfigStore::new(db));
    if registered {
        config
            .set_registration_state(RegistrationState::Done)
            .await
            .unwrap();
    }
    let identity = Arc::new(IdentityManager::new(MemoryCredentialStore::new()));
    let node_key = identity.key_pair().await.unwrap().public_bytes();
    let ingestor = Arc::new(ParcelIngestor::new(parcels.clone(), records, node_key));
    let state = Arc::new(AppState::new(
        identity,
        parcels,
        endpoints,
        config,
        ingestor,
        EndpointNotifier::new(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(serve(state.clone(), listener, shutdown.clone()));

    TestServer {
        base_url: format!("http://{addr}"),
        state,
        http: reqwest::Client::new(),
        _shutdown: shutdown,
        _temp: temp,
    }
}

/// Run the two-step registration for a fresh endpoint; returns its keys,
/// address, and certificate chain
async fn register_endpoint(server: &TestServer) -> (NodeKeyPair, String, Vec<Certificate>) {
    let keys = NodeKeyPair::generate();
    let pre: serde_json::Value = server
        .http
        .post(format!("{}/v1/pre-registrations", server.base_url))
        .json(&json!({
            "public_key": hex::encode(keys.public_bytes()),
            "application_id": "app.example",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let authorization = pre["authorization"].as_str().unwrap().to_string();

    let response = server
        .http
        .post(format!("{}/v1/endpoints", server.base_url))
        .json(&json!({
            "public_key": hex::encode(keys.public_bytes()),
            "authorization": authorization,
            "application_id": "app.example",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    let address = body["address"].as_str().unwrap().to_string();
    let chain: Vec<Certificate> =
        postcard::from_bytes(&hex::decode(body["certificate_chain"].as_str().unwrap()).unwrap())
            .unwrap();
    (keys, address, chain)
}

fn seal_parcel(signer: &NodeKeyPair, chain: Vec<Certificate>, recipient: &str, id: &str) -> Vec<u8> {
    Envelope::seal(
        EnvelopeKind::Parcel,
        recipient,
        id,
        Duration::hours(6),
        b"ciphertext".to_vec(),
        chain,
        signer,
    )
    .unwrap()
    .to_bytes()
    .unwrap()
}

#[tokio::test]
async fn test_health() {
    let server = boot(true).await;
    let body: serde_json::Value = server
        .http
        .get(format!("{}/v1/health", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["node_address"].as_str().unwrap().starts_with('0'));
}

#[tokio::test]
async fn test_endpoint_registration_issues_valid_chain() {
    let server = boot(true).await;
    let (_keys, address, chain) = register_endpoint(&server).await;

    // The chain roots at the node identity key
    let node_key = server
        .state
        .identity
        .key_pair()
        .await
        .unwrap()
        .public_bytes();
    validate_chain(&chain, &[node_key], chrono::Utc::now()).unwrap();
    assert!(server.state.endpoints.contains(&address).await.unwrap());
}

#[tokio::test]
async fn test_endpoint_registration_gated_on_node_registration() {
    let server = boot(false).await;
    let keys = NodeKeyPair::generate();
    let response = server
        .http
        .post(format!("{}/v1/endpoints", server.base_url))
        .json(&json!({
            "public_key": hex::encode(keys.public_bytes()),
            "authorization": "00",
            "application_id": "app.example",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn test_authorization_is_single_use() {
    let server = boot(true).await;
    let keys = NodeKeyPair::generate();
    let pre: serde_json::Value = server
        .http
        .post(format!("{}/v1/pre-registrations", server.base_url))
        .json(&json!({
            "public_key": hex::encode(keys.public_bytes()),
            "application_id": "app.example",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let request = json!({
        "public_key": hex::encode(keys.public_bytes()),
        "authorization": pre["authorization"].as_str().unwrap(),
        "application_id": "app.example",
    });

    let first = server
        .http
        .post(format!("{}/v1/endpoints", server.base_url))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let second = server
        .http
        .post(format!("{}/v1/endpoints", server.base_url))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 403);
}

#[tokio::test]
async fn test_parcel_submission() {
    let server = boot(true).await;
    let (keys, _address, chain) = register_endpoint(&server).await;
    let parcel = seal_parcel(&keys, chain.clone(), "0someoneelsewhere", "m-1");

    let submit = |body: Vec<u8>, content_type: &'static str| {
        server
            .http
            .post(format!("{}/v1/parcels", server.base_url))
            .header("content-type", content_type)
            .body(body)
            .send()
    };

    // Accepted, and a duplicate is accepted again
    assert_eq!(
        submit(parcel.clone(), PARCEL_CONTENT_TYPE).await.unwrap().status(),
        202
    );
    assert_eq!(
        submit(parcel.clone(), PARCEL_CONTENT_TYPE).await.unwrap().status(),
        202
    );
    assert_eq!(
        server
            .state
            .parcels
            .list_for_location(RecipientLocation::ExternalGateway)
            .await
            .unwrap()
            .len(),
        1
    );

    // Wrong content type
    assert_eq!(
        submit(parcel.clone(), "application/json").await.unwrap().status(),
        415
    );
    // Undecodable body
    assert_eq!(
        submit(b"junk".to_vec(), PARCEL_CONTENT_TYPE).await.unwrap().status(),
        400
    );

    // Signed by an endpoint this node never registered
    let stranger = NodeKeyPair::generate();
    let stranger_cert = Certificate::self_issue(&stranger, Duration::days(1)).unwrap();
    let forged = seal_parcel(&stranger, vec![stranger_cert], "0someoneelsewhere", "m-2");
    assert_eq!(
        submit(forged, PARCEL_CONTENT_TYPE).await.unwrap().status(),
        422
    );
}

#[tokio::test]
async fn test_one_shot_collection_over_websocket() {
    let server = boot(true).await;
    let (keys, address, chain) = register_endpoint(&server).await;

    // An inbound parcel waiting for this endpoint
    let peer = NodeKeyPair::generate();
    let peer_cert = Certificate::self_issue(&peer, Duration::days(1)).unwrap();
    let raw = seal_parcel(&peer, vec![peer_cert], &address, "m-in");
    let outcome = server
        .state
        .ingestor
        .ingest(&raw, RecipientLocation::LocalEndpoint)
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Success(_)));

    let ws_url = format!(
        "{}/v1/parcels/collect",
        server.base_url.replacen("http", "ws", 1)
    );
    let (mut ws, _) = connect_async(ws_url.into_client_request().unwrap())
        .await
        .unwrap();

    // Challenge, then answer as the registered endpoint
    let nonce = match ws.next().await.unwrap().unwrap() {
        Message::Binary(nonce) => nonce,
        other => panic!("expected nonce, got {other:?}"),
    };
    let response = HandshakeResponse {
        signatures: vec![NonceSignature::create(&nonce, &keys, chain[0].clone())],
    };
    ws.send(Message::Binary(response.to_bytes().unwrap().into()))
        .await
        .unwrap();

    // One offered parcel, then a normal close after the ack
    let delivery = match ws.next().await.unwrap().unwrap() {
        Message::Binary(bytes) => ParcelDelivery::from_bytes(&bytes).unwrap(),
        other => panic!("expected delivery, got {other:?}"),
    };
    assert_eq!(delivery.parcel, raw);
    ws.send(Message::Binary(
        DeliveryAck {
            delivery_id: delivery.delivery_id,
        }
        .to_bytes()
        .unwrap()
        .into(),
    ))
    .await
    .unwrap();

    match ws.next().await.unwrap().unwrap() {
        Message::Close(_) => {}
        other => panic!("expected close, got {other:?}"),
    }
    // Acknowledged parcels are gone for good
    assert!(server
        .state
        .parcels
        .list_for_location(RecipientLocation::LocalEndpoint)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_keep_alive_collection_streams_new_arrivals() {
    let server = boot(true).await;
    let (keys, address, chain) = register_endpoint(&server).await;

    // One parcel already waiting before the channel opens
    let peer = NodeKeyPair::generate();
    let peer_cert = Certificate::self_issue(&peer, Duration::days(1)).unwrap();
    let first = seal_parcel(&peer, vec![peer_cert.clone()], &address, "m-first");
    server
        .state
        .ingestor
        .ingest(&first, RecipientLocation::LocalEndpoint)
        .await
        .unwrap();

    let ws_url = format!(
        "{}/v1/parcels/collect",
        server.base_url.replacen("http", "ws", 1)
    );
    let mut request = ws_url.into_client_request().unwrap();
    request.headers_mut().insert(
        KEEP_ALIVE_HEADER,
        tokio_tungstenite::tungstenite::http::HeaderValue::from_static("true"),
    );
    let (mut ws, _) = connect_async(request).await.unwrap();

    let nonce = match ws.next().await.unwrap().unwrap() {
        Message::Binary(nonce) => nonce,
        other => panic!("expected nonce, got {other:?}"),
    };
    let response = HandshakeResponse {
        signatures: vec![NonceSignature::create(&nonce, &keys, chain[0].clone())],
    };
    ws.send(Message::Binary(response.to_bytes().unwrap().into()))
        .await
        .unwrap();

    // Receiving the waiting parcel proves the session has subscribed to
    // the notifier, so nothing published below can be missed
    let delivery = match ws.next().await.unwrap().unwrap() {
        Message::Binary(bytes) => ParcelDelivery::from_bytes(&bytes).unwrap(),
        other => panic!("expected delivery, got {other:?}"),
    };
    assert_eq!(delivery.parcel, first);
    ws.send(Message::Binary(
        DeliveryAck {
            delivery_id: delivery.delivery_id,
        }
        .to_bytes()
        .unwrap()
        .into(),
    ))
    .await
    .unwrap();

    // A parcel landing mid-session is offered without reconnecting
    let second = seal_parcel(&peer, vec![peer_cert], &address, "m-second");
    server
        .state
        .ingestor
        .ingest(&second, RecipientLocation::LocalEndpoint)
        .await
        .unwrap();
    server.state.notifier.notify(NotifierEvent::ParcelArrived {
        recipient: PrivateAddress::parse(&address).unwrap(),
    });

    let streamed = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
        .await
        .expect("keep-alive channel should offer the new arrival");
    let delivery = match streamed.unwrap().unwrap() {
        Message::Binary(bytes) => ParcelDelivery::from_bytes(&bytes).unwrap(),
        other => panic!("expected delivery, got {other:?}"),
    };
    assert_eq!(delivery.parcel, second);
}

#[tokio::test]
async fn test_handshake_refused_for_unregistered_endpoint() {
    let server = boot(true).await;

    // A certificate the node never issued
    let stranger = NodeKeyPair::generate();
    let cert = Certificate::self_issue(&stranger, Duration::days(1)).unwrap();

    let ws_url = format!(
        "{}/v1/parcels/collect",
        server.base_url.replacen("http", "ws", 1)
    );
    let (mut ws, _) = connect_async(ws_url.into_client_request().unwrap())
        .await
        .unwrap();
    let nonce = match ws.next().await.unwrap().unwrap() {
        Message::Binary(nonce) => nonce,
        other => panic!("expected nonce, got {other:?}"),
    };
    let response = HandshakeResponse {
        signatures: vec![NonceSignature::create(&nonce, &stranger, cert)],
    };
    ws.send(Message::Binary(response.to_bytes().unwrap().into()))
        .await
        .unwrap();

    match ws.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.reason.as_str(), "untrusted signer");
        }
        other => panic!("expected close, got {other:?}"),
    }
}
