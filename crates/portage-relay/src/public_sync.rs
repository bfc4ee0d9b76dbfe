//! Continuous internet sync with the public gateway
//!
//! Two independent directions, each usable one-shot or kept alive:
//! `deliver` pushes queued outbound parcels upstream, `collect` drains
//! parcels the gateway holds for this node. Both are gated on the
//! registration handshake; `ensure_registered` performs it
//! opportunistically the first time a direction runs.
//!
//! Retry discipline: a transient transport failure leaves the parcel
//! queued, flips the connection state to offline, and ends the delivery
//! pass so the caller's next cycle rescans the queue. Terminal
//! rejections delete the local copy so the queue never wedges on one
//! bad parcel.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use portage_core::{
    ConnectionState, NotifierEvent, PrivateAddress, RecipientLocation, RegistrationState,
};
use portage_crypto::{CredentialStore, IdentityManager};
use portage_store::{EndpointNotifier, NodeConfigStore, ParcelStore, StoreError};

use crate::clients::{DeliveryOutcome, GatewayClient, SyncMode};
use crate::error::{ClientError, RelayError, RelayResult};
use crate::ingestion::{IngestOutcome, ParcelIngestor};

/// Drives both sync directions against the public gateway
pub struct PublicSyncEngine<S: CredentialStore> {
    parcels: Arc<ParcelStore>,
    identity: Arc<IdentityManager<S>>,
    config: Arc<NodeConfigStore>,
    ingestor: Arc<ParcelIngestor>,
    gateway: Arc<dyn GatewayClient>,
    notifier: EndpointNotifier,
    connection: watch::Sender<ConnectionState>,
}

impl<S: CredentialStore> PublicSyncEngine<S> {
    pub fn new(
        parcels: Arc<ParcelStore>,
        identity: Arc<IdentityManager<S>>,
        config: Arc<NodeConfigStore>,
        ingestor: Arc<ParcelIngestor>,
        gateway: Arc<dyn GatewayClient>,
        notifier: EndpointNotifier,
    ) -> Self {
        let (connection, _) = watch::channel(ConnectionState::default());
        Self {
            parcels,
            identity,
            config,
            ingestor,
            gateway,
            notifier,
            connection,
        }
    }

    /// Watch the gateway connection state
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Complete the registration handshake if it has not happened yet
    ///
    /// Idempotent: a node that already registered returns immediately.
    /// On success the gateway-issued identity certificate replaces the
    /// self-issued one and the gateway becomes a trust anchor.
    pub async fn ensure_registered(&self) -> RelayResult<()> {
        if self.config.registration_state().await? == RegistrationState::Done {
            return Ok(());
        }
        let keys = self.identity.key_pair().await?;
        let node_key = keys.public_bytes();

        let authorization = self.gateway.pre_register(&node_key).await?;
        let registration = self.gateway.register(&node_key, &authorization).await?;

        self.identity
            .set_gateway_certificate(&registration.gateway_certificate)
            .await?;
        let applied = self
            .identity
            .set_identity_certificate(registration.node_certificate, registration.node_chain)
            .await?;
        if applied {
            self.notifier
                .notify(NotifierEvent::IdentityCertificateRotated);
        } else {
            debug!("Gateway-issued certificate does not outlive the current one");
        }
        self.config
            .set_registration_state(RegistrationState::Done)
            .await?;
        self.config
            .set_registered_gateway(&self.gateway.remote_address())
            .await?;
        info!(gateway = self.gateway.remote_address(), "Registered with public gateway");
        Ok(())
    }

    /// Push queued outbound parcels to the gateway
    ///
    /// One-shot mode drains the current queue and returns. Keep-alive
    /// mode then follows the store's insert feed until cancelled — or
    /// until a transient failure defers a parcel, which ends the pass so
    /// the caller's next cycle rescans the queue instead of waiting on
    /// unrelated inserts.
    pub async fn deliver(&self, mode: SyncMode, cancel: &CancellationToken) -> RelayResult<()> {
        self.ensure_registered().await?;

        // Subscribe before the snapshot so nothing slips between them
        let mut feed = self.parcels.subscribe();
        let mut deferred = false;
        for parcel in self
            .parcels
            .list_for_location(RecipientLocation::ExternalGateway)
            .await?
        {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if !self.deliver_one(&parcel).await? {
                deferred = true;
            }
        }
        if mode == SyncMode::OneShot {
            return Ok(());
        }
        if deferred {
            debug!("Outbound parcels deferred; ending delivery pass");
            return Ok(());
        }

        loop {
            let parcel = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = feed.recv() => match received {
                    Ok(parcel) => parcel,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        // Fall back to a fresh snapshot after losing events
                        warn!(missed, "Delivery feed lagged, rescanning queue");
                        for parcel in self
                            .parcels
                            .list_for_location(RecipientLocation::ExternalGateway)
                            .await?
                        {
                            if !self.deliver_one(&parcel).await? {
                                return Ok(());
                            }
                        }
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                },
            };
            if parcel.location == RecipientLocation::ExternalGateway
                && !self.deliver_one(&parcel).await?
            {
                return Ok(());
            }
        }
    }

    /// Returns false when a transient failure left the parcel queued
    async fn deliver_one(&self, parcel: &portage_core::StoredParcel) -> RelayResult<bool> {
        let key = parcel.key();
        if parcel.is_expired_at(chrono::Utc::now()) {
            self.parcels.delete(&key).await?;
            return Ok(true);
        }
        let blob = match self.parcels.load_blob(parcel).await {
            Ok(bytes) => bytes,
            Err(StoreError::BlobMissing(_)) => {
                warn!(key = %key, "Dropping parcel with missing blob");
                self.parcels.delete(&key).await?;
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };
        match self.gateway.deliver_parcel(&blob).await {
            Ok(DeliveryOutcome::Delivered) => {
                debug!(key = %key, "Delivered parcel to gateway");
                self.parcels.delete(&key).await?;
                self.connection
                    .send_replace(ConnectionState::InternetGateway);
            }
            Ok(DeliveryOutcome::Rejected(reason)) => {
                // Terminal: the gateway will never accept this parcel
                warn!(key = %key, reason, "Gateway rejected parcel");
                self.parcels.delete(&key).await?;
                self.connection
                    .send_replace(ConnectionState::InternetGateway);
            }
            Err(ClientError::Transient(reason)) => {
                debug!(key = %key, reason, "Parcel delivery deferred");
                self.connection.send_replace(ConnectionState::Offline);
                return Ok(false);
            }
            Err(e) => return Err(RelayError::Client(e)),
        }
        Ok(true)
    }

    /// Drain parcels the gateway holds for this node
    ///
    /// Every received parcel is acknowledged, whatever the ingestion
    /// outcome; the gateway's copy is spent either way. Keep-alive mode
    /// notifies endpoints per parcel, one-shot mode batches one
    /// notification per recipient after the channel closes.
    pub async fn collect(&self, mode: SyncMode, cancel: &CancellationToken) -> RelayResult<()> {
        self.ensure_registered().await?;

        let keys = self.identity.key_pair().await?;
        let certificate = self.identity.identity_certificate().await?;
        let mut channel = self
            .gateway
            .collect_parcels(&keys, certificate, mode)
            .await?;
        self.connection
            .send_replace(ConnectionState::InternetGateway);

        let mut arrived: Vec<PrivateAddress> = Vec::new();
        loop {
            let collected = tokio::select! {
                _ = cancel.cancelled() => break,
                next = channel.next() => match next {
                    Ok(Some(collected)) => collected,
                    Ok(None) => break,
                    Err(ClientError::Transient(reason)) => {
                        debug!(reason, "Collection channel dropped");
                        self.connection.send_replace(ConnectionState::Offline);
                        break;
                    }
                    Err(e) => return Err(RelayError::Client(e)),
                },
            };
            let outcome = self
                .ingestor
                .ingest(&collected.parcel, RecipientLocation::LocalEndpoint)
                .await?;
            channel.ack(&collected.delivery_id).await?;

            if let IngestOutcome::Success(parcel) = outcome {
                if let Ok(recipient) = PrivateAddress::parse(&parcel.recipient) {
                    match mode {
                        SyncMode::KeepAlive => self
                            .notifier
                            .notify(NotifierEvent::ParcelArrived { recipient }),
                        SyncMode::OneShot => {
                            if !arrived.contains(&recipient) {
                                arrived.push(recipient);
                            }
                        }
                    }
                }
            } else {
                debug!(delivery_id = collected.delivery_id, ?outcome, "Acked non-stored parcel");
            }
        }

        for recipient in arrived {
            self.notifier
                .notify(NotifierEvent::ParcelArrived { recipient });
        }
        Ok(())
    }
}
