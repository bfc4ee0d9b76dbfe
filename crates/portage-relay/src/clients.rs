//! Remote-peer abstractions: the public gateway and the courier
//!
//! The sync engines drive these traits; concrete HTTP/WebSocket and
//! framed-TCP implementations live in sibling modules, and in-memory
//! mocks in [`crate::mock`].

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use portage_crypto::{Certificate, KeyBytes, NodeKeyPair};

use crate::error::ClientError;

/// Streaming vs one-shot operation of a sync direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Take one snapshot, process it, and stop
    OneShot,
    /// Keep the channel open and process items as they appear
    KeepAlive,
}

/// Outcome of delivering one parcel to the public gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Accepted; the local copy can be deleted
    Delivered,
    /// Terminally refused; the local copy is deleted, never retried
    Rejected(String),
}

/// What the node gets back from the registration handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRegistration {
    /// Identity certificate the gateway issued for this node
    pub node_certificate: Certificate,
    /// Chain from the node certificate up to the gateway's root
    pub node_chain: Vec<Certificate>,
    /// The gateway's own certificate, this node's second trust anchor
    pub gateway_certificate: Certificate,
}

/// A parcel received over a collection channel
#[derive(Debug, Clone)]
pub struct CollectedParcel {
    pub delivery_id: String,
    pub parcel: Vec<u8>,
}

/// The continuous or one-shot internet link to the public gateway
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// The remote address this client talks to, for logs and migration
    /// detection
    fn remote_address(&self) -> String;

    /// First half of the registration handshake; returns an opaque
    /// authorization to present to `register`
    async fn pre_register(&self, node_key: &KeyBytes) -> Result<Vec<u8>, ClientError>;

    /// Second half of the registration handshake
    async fn register(
        &self,
        node_key: &KeyBytes,
        authorization: &[u8],
    ) -> Result<GatewayRegistration, ClientError>;

    /// Deliver one sealed parcel
    async fn deliver_parcel(&self, parcel: &[u8]) -> Result<DeliveryOutcome, ClientError>;

    /// Open a collection channel, authenticating as this node
    async fn collect_parcels(
        &self,
        signer: &NodeKeyPair,
        certificate: Certificate,
        mode: SyncMode,
    ) -> Result<Box<dyn ParcelCollection>, ClientError>;
}

/// An open parcel-collection channel
#[async_trait]
pub trait ParcelCollection: Send {
    /// The next parcel, or `None` once the channel closes
    async fn next(&mut self) -> Result<Option<CollectedParcel>, ClientError>;

    /// Acknowledge a delivery id so the remote side stops serving it
    async fn ack(&mut self, delivery_id: &str) -> Result<(), ClientError>;
}

/// The intermittent link to a physically present courier
#[async_trait]
pub trait CourierClient: Send + Sync {
    /// Liveness probe: is something actually listening at `addr`?
    ///
    /// Address visibility alone is not trusted; a courier run only
    /// proceeds once this returns true.
    async fn probe(&self, addr: SocketAddr) -> bool;

    /// Hand one sealed cargo container to the courier
    async fn deliver_cargo(&self, addr: SocketAddr, cargo: &[u8]) -> Result<(), ClientError>;

    /// Present a cargo collection request and receive waiting containers
    async fn collect_cargo(
        &self,
        addr: SocketAddr,
        request: &[u8],
    ) -> Result<Vec<Vec<u8>>, ClientError>;
}

/// Observer that discovers a courier's address on the local network
#[async_trait]
pub trait CourierDetector: Send + Sync {
    /// A candidate courier address, if one is visible right now
    async fn detect(&self) -> Option<SocketAddr>;
}
