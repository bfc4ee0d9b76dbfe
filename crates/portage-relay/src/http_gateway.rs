//! HTTP and WebSocket client for the public gateway
//!
//! Registration and parcel delivery are plain HTTP POSTs; collection is
//! a WebSocket channel opened with the same nonce handshake the local
//! control server uses. Transport-level failures and 5xx responses map
//! to `ClientError::Transient`, 4xx responses to the terminal variants.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use portage_core::PARCEL_CONTENT_TYPE;
use portage_crypto::{
    Certificate, DeliveryAck, HandshakeResponse, KeyBytes, NodeKeyPair, NonceSignature,
    ParcelDelivery,
};
use serde::{Deserialize, Serialize};

use crate::clients::{
    CollectedParcel, DeliveryOutcome, GatewayClient, GatewayRegistration, ParcelCollection,
    SyncMode,
};
use crate::error::ClientError;

/// Header selecting keep-alive collection on the WebSocket upgrade
pub const KEEP_ALIVE_HEADER: &str = "x-keep-alive";

/// Body of the registration POST
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeRegistrationRequest {
    pub node_key: KeyBytes,
    pub authorization: Vec<u8>,
}

/// Public-gateway client over HTTPS and WebSocket
pub struct HttpGatewayClient {
    /// Origin of the gateway, e.g. `https://gateway.example.com`
    base_url: String,
    http: reqwest::Client,
}

impl HttpGatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// The collection endpoint with the scheme switched to WebSocket
    fn ws_url(&self, path: &str) -> String {
        let ws_base = self.base_url.replacen("http", "ws", 1);
        format!("{ws_base}{path}")
    }

    async fn read_body(
        response: reqwest::Response,
    ) -> Result<(StatusCode, Vec<u8>), ClientError> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;
        Ok((status, body.to_vec()))
    }

    fn classify(status: StatusCode, body: &[u8]) -> Result<(), ClientError> {
        if status.is_success() {
            return Ok(());
        }
        let detail = String::from_utf8_lossy(body).into_owned();
        if status.is_client_error() {
            Err(ClientError::Rejected(format!("{status}: {detail}")))
        } else {
            Err(ClientError::Transient(format!("{status}: {detail}")))
        }
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    fn remote_address(&self) -> String {
        self.base_url.clone()
    }

    async fn pre_register(&self, node_key: &KeyBytes) -> Result<Vec<u8>, ClientError> {
        let response = self
            .http
            .post(self.url("/v1/nodes/pre-register"))
            .body(node_key.to_vec())
            .send()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;
        let (status, body) = Self::read_body(response).await?;
        Self::classify(status, &body)?;
        Ok(body)
    }

    async fn register(
        &self,
        node_key: &KeyBytes,
        authorization: &[u8],
    ) -> Result<GatewayRegistration, ClientError> {
        let request = NodeRegistrationRequest {
            node_key: *node_key,
            authorization: authorization.to_vec(),
        };
        let body = postcard::to_allocvec(&request)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let response = self
            .http
            .post(self.url("/v1/nodes"))
            .body(body)
            .send()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;
        let (status, body) = Self::read_body(response).await?;
        Self::classify(status, &body)?;
        postcard::from_bytes(&body).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    async fn deliver_parcel(&self, parcel: &[u8]) -> Result<DeliveryOutcome, ClientError> {
        let response = self
            .http
            .post(self.url("/v1/parcels"))
            .header(reqwest::header::CONTENT_TYPE, PARCEL_CONTENT_TYPE)
            .body(parcel.to_vec())
            .send()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;
        let (status, body) = Self::read_body(response).await?;
        match Self::classify(status, &body) {
            Ok(()) => Ok(DeliveryOutcome::Delivered),
            Err(ClientError::Rejected(reason)) => Ok(DeliveryOutcome::Rejected(reason)),
            Err(e) => Err(e),
        }
    }

    async fn collect_parcels(
        &self,
        signer: &NodeKeyPair,
        certificate: Certificate,
        mode: SyncMode,
    ) -> Result<Box<dyn ParcelCollection>, ClientError> {
        let mut request = self
            .ws_url("/v1/parcels/collect")
            .into_client_request()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let keep_alive = match mode {
            SyncMode::KeepAlive => HeaderValue::from_static("true"),
            SyncMode::OneShot => HeaderValue::from_static("false"),
        };
        request.headers_mut().insert(KEEP_ALIVE_HEADER, keep_alive);

        let (mut stream, _) = connect_async(request)
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;

        // Challenge first: the server sends a nonce, we answer with one
        // signature proving this node's identity
        let nonce = match stream.next().await {
            Some(Ok(Message::Binary(nonce))) => nonce,
            Some(Ok(other)) => {
                return Err(ClientError::Protocol(format!(
                    "expected nonce, got {other:?}"
                )));
            }
            Some(Err(e)) => return Err(ClientError::Transient(e.to_string())),
            None => return Err(ClientError::Transient("channel closed on open".into())),
        };
        let response = HandshakeResponse {
            signatures: vec![NonceSignature::create(&nonce, signer, certificate)],
        };
        let response_bytes = response
            .to_bytes()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        stream
            .send(Message::Binary(Bytes::from(response_bytes)))
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;
        debug!("Collection channel handshake sent");

        Ok(Box::new(WsParcelCollection { stream }))
    }
}

/// Open WebSocket collection channel
struct WsParcelCollection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ParcelCollection for WsParcelCollection {
    async fn next(&mut self) -> Result<Option<CollectedParcel>, ClientError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let delivery = ParcelDelivery::from_bytes(&data)
                        .map_err(|e| ClientError::Protocol(e.to_string()))?;
                    return Ok(Some(CollectedParcel {
                        delivery_id: delivery.delivery_id,
                        parcel: delivery.parcel,
                    }));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Collection channel closed by gateway");
                    return Ok(None);
                }
                // Pings are answered by the library; skip everything else
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ClientError::Transient(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn ack(&mut self, delivery_id: &str) -> Result<(), ClientError> {
        let ack = DeliveryAck {
            delivery_id: delivery_id.to_string(),
        };
        let bytes = ack
            .to_bytes()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.stream
            .send(Message::Binary(Bytes::from(bytes)))
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))
    }
}
