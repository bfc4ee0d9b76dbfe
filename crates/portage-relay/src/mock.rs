//! In-memory gateway and courier doubles for tests
//!
//! The mocks run the real certificate and envelope machinery; only the
//! transport is simulated. They live in the library (not a test module)
//! so the server and node crates can exercise their composition against
//! them too.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Duration;

use portage_core::PrivateAddress;
use portage_crypto::{Certificate, KeyBytes, NodeKeyPair, verify_signature};
use portage_crypto::{Envelope, EnvelopeKind};

use crate::clients::{
    CollectedParcel, CourierClient, CourierDetector, DeliveryOutcome, GatewayClient,
    GatewayRegistration, ParcelCollection, SyncMode,
};
use crate::error::ClientError;

/// Validity of a mock-gateway-issued node certificate; longer than a
/// self-issued one so rotation always applies
const MOCK_NODE_CERT_DAYS: i64 = 800;

/// Seal a parcel from a fresh endpoint registered under `node`, bound
/// for a random private recipient
pub fn seal_endpoint_parcel(node: &NodeKeyPair, message_id: &str) -> Vec<u8> {
    let endpoint = NodeKeyPair::generate();
    let chain = vec![
        Certificate::issue(endpoint.public_bytes(), node, Duration::days(180))
            .unwrap_or_else(|e| panic!("issue endpoint certificate: {e}")),
    ];
    let recipient = PrivateAddress::derive(&rand::random::<[u8; 32]>());
    Envelope::seal(
        EnvelopeKind::Parcel,
        recipient.as_str(),
        message_id,
        Duration::hours(6),
        b"ciphertext".to_vec(),
        chain,
        &endpoint,
    )
    .and_then(|e| e.to_bytes())
    .unwrap_or_else(|e| panic!("seal parcel: {e}"))
}

enum DeliveryBehavior {
    Accept,
    Transient,
    TransientTimes(AtomicUsize),
    Reject(String),
}

/// Scriptable stand-in for the public gateway
pub struct MockGateway {
    keys: NodeKeyPair,
    certificate: Certificate,
    registrations: AtomicUsize,
    delivery: DeliveryBehavior,
    delivered: Mutex<Vec<Vec<u8>>>,
    held: Mutex<VecDeque<CollectedParcel>>,
    acked: std::sync::Arc<Mutex<Vec<String>>>,
}

impl MockGateway {
    pub fn new() -> Self {
        let keys = NodeKeyPair::generate();
        let certificate = Certificate::self_issue(&keys, Duration::days(3650))
            .unwrap_or_else(|e| panic!("self-issue gateway certificate: {e}"));
        Self {
            keys,
            certificate,
            registrations: AtomicUsize::new(0),
            delivery: DeliveryBehavior::Accept,
            delivered: Mutex::new(Vec::new()),
            held: Mutex::new(VecDeque::new()),
            acked: std::sync::Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every parcel delivery fails as if the link dropped
    pub fn with_transient_delivery(mut self) -> Self {
        self.delivery = DeliveryBehavior::Transient;
        self
    }

    /// The first `count` deliveries fail transiently, later ones succeed
    pub fn with_transient_failures(mut self, count: usize) -> Self {
        self.delivery = DeliveryBehavior::TransientTimes(AtomicUsize::new(count));
        self
    }

    /// Every parcel delivery is terminally refused
    pub fn with_rejected_delivery(mut self, reason: &str) -> Self {
        self.delivery = DeliveryBehavior::Reject(reason.to_string());
        self
    }

    /// Queue a parcel for the node to collect
    pub fn hold_parcel(&self, delivery_id: &str, parcel: Vec<u8>) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(CollectedParcel {
                delivery_id: delivery_id.to_string(),
                parcel,
            });
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<Vec<u8>> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn public_bytes(&self) -> KeyBytes {
        self.keys.public_bytes()
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayClient for MockGateway {
    fn remote_address(&self) -> String {
        "https://mock-gateway.test".to_string()
    }

    async fn pre_register(&self, node_key: &KeyBytes) -> Result<Vec<u8>, ClientError> {
        // The authorization is the gateway's signature over the node key
        Ok(self.keys.sign(node_key))
    }

    async fn register(
        &self,
        node_key: &KeyBytes,
        authorization: &[u8],
    ) -> Result<GatewayRegistration, ClientError> {
        verify_signature(&self.keys.public_bytes(), node_key, authorization)
            .map_err(|_| ClientError::Rejected("bad pre-registration".to_string()))?;
        self.registrations.fetch_add(1, Ordering::SeqCst);

        let node_certificate =
            Certificate::issue(*node_key, &self.keys, Duration::days(MOCK_NODE_CERT_DAYS))
                .map_err(|e| ClientError::Protocol(e.to_string()))?;
        Ok(GatewayRegistration {
            node_certificate,
            node_chain: vec![self.certificate.clone()],
            gateway_certificate: self.certificate.clone(),
        })
    }

    async fn deliver_parcel(&self, parcel: &[u8]) -> Result<DeliveryOutcome, ClientError> {
        match &self.delivery {
            DeliveryBehavior::Accept => {
                self.delivered
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(parcel.to_vec());
                Ok(DeliveryOutcome::Delivered)
            }
            DeliveryBehavior::Transient => {
                Err(ClientError::Transient("connection refused".to_string()))
            }
            DeliveryBehavior::TransientTimes(remaining) => {
                let failed = remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failed {
                    return Err(ClientError::Transient("connection refused".to_string()));
                }
                self.delivered
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(parcel.to_vec());
                Ok(DeliveryOutcome::Delivered)
            }
            DeliveryBehavior::Reject(reason) => Ok(DeliveryOutcome::Rejected(reason.clone())),
        }
    }

    async fn collect_parcels(
        &self,
        _signer: &NodeKeyPair,
        _certificate: Certificate,
        _mode: SyncMode,
    ) -> Result<Box<dyn ParcelCollection>, ClientError> {
        let queued: VecDeque<CollectedParcel> = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        Ok(Box::new(MockCollection {
            queued,
            acked: self.acked.clone(),
        }))
    }
}

struct MockCollection {
    queued: VecDeque<CollectedParcel>,
    acked: std::sync::Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ParcelCollection for MockCollection {
    async fn next(&mut self) -> Result<Option<CollectedParcel>, ClientError> {
        Ok(self.queued.pop_front())
    }

    async fn ack(&mut self, delivery_id: &str) -> Result<(), ClientError> {
        self.acked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(delivery_id.to_string());
        Ok(())
    }
}

/// Scriptable stand-in for a courier
pub struct MockCourier {
    reachable: bool,
    delivered: Mutex<Vec<Vec<u8>>>,
    to_collect: Mutex<Vec<Vec<u8>>>,
    last_request: Mutex<Option<Vec<u8>>>,
}

impl MockCourier {
    pub fn reachable() -> Self {
        Self {
            reachable: true,
            delivered: Mutex::new(Vec::new()),
            to_collect: Mutex::new(Vec::new()),
            last_request: Mutex::new(None),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::reachable()
        }
    }

    /// Queue a cargo container for the node to collect
    pub fn load_cargo(&self, cargo: Vec<u8>) {
        self.to_collect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cargo);
    }

    pub fn delivered(&self) -> Vec<Vec<u8>> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The last cargo collection request presented
    pub fn last_request(&self) -> Option<Vec<u8>> {
        self.last_request
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CourierClient for MockCourier {
    async fn probe(&self, _addr: SocketAddr) -> bool {
        self.reachable
    }

    async fn deliver_cargo(&self, _addr: SocketAddr, cargo: &[u8]) -> Result<(), ClientError> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cargo.to_vec());
        Ok(())
    }

    async fn collect_cargo(
        &self,
        _addr: SocketAddr,
        request: &[u8],
    ) -> Result<Vec<Vec<u8>>, ClientError> {
        *self.last_request.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(request.to_vec());
        Ok(self
            .to_collect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect())
    }
}

/// Detector returning a fixed candidate
pub struct MockDetector {
    addr: Option<SocketAddr>,
}

impl MockDetector {
    pub fn none() -> Self {
        Self { addr: None }
    }

    pub fn at(addr: SocketAddr) -> Self {
        Self { addr: Some(addr) }
    }
}

#[async_trait]
impl CourierDetector for MockDetector {
    async fn detect(&self) -> Option<SocketAddr> {
        self.addr
    }
}
