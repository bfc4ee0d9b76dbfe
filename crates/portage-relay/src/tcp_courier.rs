//! Framed TCP link to a courier on the local network
//!
//! Couriers speak a minimal length-prefixed protocol: every frame is a
//! little-endian u32 length followed by a postcard-encoded
//! [`CourierFrame`]. One connection carries one operation; delivery and
//! collection each open their own.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::clients::{CourierClient, CourierDetector};
use crate::error::ClientError;

/// Upper bound on one frame, above the largest cargo container
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Connect and per-frame I/O deadline
const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe deadline; a courier that cannot accept in this window is
/// treated as absent
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Wire frames of the courier protocol
#[derive(Debug, Serialize, Deserialize)]
pub enum CourierFrame {
    /// Node to courier: one sealed cargo container
    DeliverCargo(Vec<u8>),
    /// Courier to node: the container was accepted
    CargoDelivered,
    /// Node to courier: a sealed cargo collection request
    CollectCargo(Vec<u8>),
    /// Courier to node: one container held for this node
    CargoChunk(Vec<u8>),
    /// Courier to node: nothing further follows
    CollectionDone,
}

async fn write_frame(stream: &mut TcpStream, frame: &CourierFrame) -> Result<(), ClientError> {
    let payload =
        postcard::to_allocvec(frame).map_err(|e| ClientError::Protocol(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ClientError::Protocol("frame exceeds maximum length".into()));
    }
    let io = async {
        stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
        stream.write_all(&payload).await?;
        stream.flush().await
    };
    timeout(IO_TIMEOUT, io)
        .await
        .map_err(|_| ClientError::Transient("courier write timed out".into()))?
        .map_err(|e| ClientError::Transient(e.to_string()))
}

async fn read_frame(stream: &mut TcpStream) -> Result<CourierFrame, ClientError> {
    let io = async {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame exceeds maximum length",
            ));
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok(payload)
    };
    let payload = timeout(IO_TIMEOUT, io)
        .await
        .map_err(|_| ClientError::Transient("courier read timed out".into()))?
        .map_err(|e| ClientError::Transient(e.to_string()))?;
    postcard::from_bytes(&payload).map_err(|e| ClientError::Protocol(e.to_string()))
}

/// Courier client over plain TCP
#[derive(Default)]
pub struct TcpCourierClient;

impl TcpCourierClient {
    pub fn new() -> Self {
        Self
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, ClientError> {
        timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Transient("courier connect timed out".into()))?
            .map_err(|e| ClientError::Transient(e.to_string()))
    }
}

#[async_trait]
impl CourierClient for TcpCourierClient {
    async fn probe(&self, addr: SocketAddr) -> bool {
        matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
    }

    async fn deliver_cargo(&self, addr: SocketAddr, cargo: &[u8]) -> Result<(), ClientError> {
        let mut stream = self.connect(addr).await?;
        write_frame(&mut stream, &CourierFrame::DeliverCargo(cargo.to_vec())).await?;
        match read_frame(&mut stream).await? {
            CourierFrame::CargoDelivered => {
                debug!(courier = %addr, size = cargo.len(), "Courier accepted cargo");
                Ok(())
            }
            other => Err(ClientError::Protocol(format!(
                "unexpected frame after delivery: {other:?}"
            ))),
        }
    }

    async fn collect_cargo(
        &self,
        addr: SocketAddr,
        request: &[u8],
    ) -> Result<Vec<Vec<u8>>, ClientError> {
        let mut stream = self.connect(addr).await?;
        write_frame(&mut stream, &CourierFrame::CollectCargo(request.to_vec())).await?;

        let mut containers = Vec::new();
        loop {
            match read_frame(&mut stream).await? {
                CourierFrame::CargoChunk(cargo) => containers.push(cargo),
                CourierFrame::CollectionDone => break,
                other => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected frame during collection: {other:?}"
                    )));
                }
            }
        }
        debug!(courier = %addr, containers = containers.len(), "Collected cargo");
        Ok(containers)
    }
}

/// Detector returning a statically configured courier address
///
/// Discovery is deliberately simple: the deployment knows where its
/// courier docks. The liveness probe, not detection, decides whether a
/// run proceeds.
pub struct ConfiguredCourierDetector {
    candidate: Option<SocketAddr>,
}

impl ConfiguredCourierDetector {
    pub fn new(candidate: Option<SocketAddr>) -> Self {
        Self { candidate }
    }
}

#[async_trait]
impl CourierDetector for ConfiguredCourierDetector {
    async fn detect(&self) -> Option<SocketAddr> {
        self.candidate
    }
}
