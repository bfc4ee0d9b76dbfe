//! The WebSocket parcel-collection channel
//!
//! Applications collect inbound parcels here. The channel opens with a
//! nonce challenge; the client answers with one signature per endpoint
//! it claims, each proven by a node-issued certificate. Parcels are then
//! offered tagged with per-session delivery ids and deleted only on
//! acknowledgement, so an application that crashes mid-collection sees
//! the same parcels again next session.
//!
//! One-shot sessions (the default) close once everything offered is
//! acknowledged; a `x-keep-alive: true` upgrade header keeps the channel
//! open, following the endpoint notifier so arrivals stored by the sync
//! engines or a cargo run are offered as they land.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, warn};

use portage_core::{NotifierEvent, ParcelKey, RecipientLocation, StoredParcel};
use portage_crypto::{
    CredentialStore, DeliveryAck, ParcelDelivery, generate_nonce, verify_handshake_response,
};
use portage_relay::KEEP_ALIVE_HEADER;
use portage_store::StoreError;

use crate::state::AppState;

/// Deadline for the client's handshake response
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn collect_ws<S: CredentialStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let keep_alive = headers
        .get(KEEP_ALIVE_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = session(state, socket, keep_alive).await {
            warn!(error = %e, "Collection session failed");
        }
    })
}

async fn close(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn session<S: CredentialStore>(
    state: Arc<AppState<S>>,
    mut socket: WebSocket,
    keep_alive: bool,
) -> Result<(), crate::error::ApiError> {
    // Challenge
    let nonce = generate_nonce();
    if socket
        .send(Message::Binary(nonce.to_vec().into()))
        .await
        .is_err()
    {
        return Ok(());
    }
    let response = match timeout(HANDSHAKE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Binary(bytes)))) => bytes,
        Ok(_) | Err(_) => {
            close(socket, close_code::POLICY, "malformed handshake").await;
            return Ok(());
        }
    };
    let keys = state.identity.key_pair().await?;
    let addresses = match verify_handshake_response(
        &nonce,
        &response,
        &[keys.public_bytes()],
        Utc::now(),
    ) {
        Ok(addresses) => addresses,
        Err(e) => {
            debug!(error = %e, "Refusing collection handshake");
            close(socket, close_code::POLICY, e.close_reason()).await;
            return Ok(());
        }
    };

    // Only currently registered endpoints may collect
    let mut recipients = Vec::new();
    for address in addresses {
        if state.endpoints.contains(address.as_str()).await? {
            recipients.push(address.as_str().to_string());
        } else {
            debug!(address = %address, "Ignoring unregistered endpoint claim");
        }
    }
    if recipients.is_empty() {
        close(socket, close_code::POLICY, "no registered endpoints").await;
        return Ok(());
    }

    // Subscribe before the snapshot so arrivals in between are not lost
    let mut feed = state.notifier.subscribe();
    let snapshot = state
        .parcels
        .list_for_recipients(&recipients, RecipientLocation::LocalEndpoint)
        .await?;

    let mut session = CollectSession::default();
    for parcel in snapshot {
        session.offer(&state, &mut socket, parcel).await?;
    }
    if !keep_alive && session.pending.is_empty() {
        close(socket, close_code::NORMAL, "nothing to collect").await;
        return Ok(());
    }

    loop {
        tokio::select! {
            received = socket.recv() => {
                let message = match received {
                    Some(Ok(message)) => message,
                    Some(Err(_)) | None => return Ok(()),
                };
                match message {
                    Message::Binary(bytes) => {
                        let Ok(ack) = DeliveryAck::from_bytes(&bytes) else {
                            debug!("Ignoring undecodable client message");
                            continue;
                        };
                        session.acknowledge(&state, &ack.delivery_id).await?;
                        if !keep_alive && session.pending.is_empty() {
                            close(socket, close_code::NORMAL, "collection complete").await;
                            return Ok(());
                        }
                    }
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
            event = feed.recv(), if keep_alive => {
                match event {
                    Ok(NotifierEvent::ParcelArrived { recipient })
                        if recipients.iter().any(|r| r == recipient.as_str()) =>
                    {
                        let parcels = state
                            .parcels
                            .list_for_recipients(
                                &[recipient.as_str().to_string()],
                                RecipientLocation::LocalEndpoint,
                            )
                            .await?;
                        for parcel in parcels {
                            session.offer(&state, &mut socket, parcel).await?;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        // Catch up from a fresh snapshot; offered ids
                        // de-duplicate what the feed already served
                        warn!(missed, "Collection feed lagged, rescanning");
                        let parcels = state
                            .parcels
                            .list_for_recipients(&recipients, RecipientLocation::LocalEndpoint)
                            .await?;
                        for parcel in parcels {
                            session.offer(&state, &mut socket, parcel).await?;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

/// Per-session offer and acknowledgement bookkeeping
#[derive(Default)]
struct CollectSession {
    /// Storage keys already offered this session
    offered: HashSet<Vec<u8>>,
    /// Delivery id to parcel key, awaiting acknowledgement
    pending: HashMap<String, ParcelKey>,
    counter: u64,
}

impl CollectSession {
    async fn offer<S: CredentialStore>(
        &mut self,
        state: &AppState<S>,
        socket: &mut WebSocket,
        parcel: StoredParcel,
    ) -> Result<(), crate::error::ApiError> {
        let key = parcel.key();
        if !self.offered.insert(key.storage_bytes()) {
            return Ok(());
        }
        let blob = match state.parcels.load_blob(&parcel).await {
            Ok(blob) => blob,
            Err(StoreError::BlobMissing(_)) => {
                warn!(key = %key, "Dropping parcel with missing blob");
                state.parcels.delete(&key).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.counter += 1;
        let delivery_id = format!("d-{}", self.counter);
        let delivery = ParcelDelivery {
            delivery_id: delivery_id.clone(),
            parcel: blob.to_vec(),
        };
        if socket
            .send(Message::Binary(delivery.to_bytes()?.into()))
            .await
            .is_ok()
        {
            debug!(key = %key, delivery_id, "Offered parcel");
            self.pending.insert(delivery_id, key);
        }
        Ok(())
    }

    async fn acknowledge<S: CredentialStore>(
        &mut self,
        state: &AppState<S>,
        delivery_id: &str,
    ) -> Result<(), crate::error::ApiError> {
        match self.pending.remove(delivery_id) {
            Some(key) => {
                state.parcels.delete(&key).await?;
                debug!(key = %key, delivery_id, "Parcel collected");
            }
            None => debug!(delivery_id, "Ignoring unknown delivery id"),
        }
        Ok(())
    }
}
