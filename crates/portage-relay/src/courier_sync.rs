//! Courier-mediated cargo exchange
//!
//! A courier run is one pass of the physical-relay protocol: hand over
//! every outbound cargo container, wait a quiescent interval so the
//! courier can settle what it received, then present a signed cargo
//! collection request and unpack whatever the courier was carrying for
//! this node. Progress is published on a watch channel so the control
//! surface can show a live run to local applications.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use portage_crypto::{CredentialStore, Envelope, EnvelopeKind, IdentityManager, random_message_id};
use portage_store::CargoStagingStore;

use crate::cargo_codec::CargoCodec;
use crate::clients::{CourierClient, CourierDetector};
use crate::error::{CourierSyncError, RelayError};

/// Pause between delivery and collection, giving the courier time to
/// settle what it just received
pub const QUIESCENT_WAIT: StdDuration = StdDuration::from_secs(2);

/// Validity window of a cargo collection request
const COLLECTION_REQUEST_TTL_MINUTES: i64 = 30;

/// Observable phase of a courier run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CourierSyncState {
    /// Run started; outbound cargo is being handed over
    #[default]
    DeliveringCargo,
    /// Delivery done; in the quiescent pause before collection
    Waiting,
    /// Collection request presented; unpacking received cargo
    CollectingCargo,
    /// Run completed
    Finished,
    /// Run aborted after the courier was engaged
    Error,
}

/// Drives one courier run at a time
pub struct CourierSyncEngine<S: CredentialStore> {
    codec: Arc<CargoCodec<S>>,
    identity: Arc<IdentityManager<S>>,
    staging: Arc<CargoStagingStore>,
    courier: Arc<dyn CourierClient>,
    detector: Arc<dyn CourierDetector>,
    /// Address of the public gateway the cargo is ultimately bound for
    gateway_address: String,
    state: watch::Sender<CourierSyncState>,
    quiescent_wait: StdDuration,
}

impl<S: CredentialStore> CourierSyncEngine<S> {
    pub fn new(
        codec: Arc<CargoCodec<S>>,
        identity: Arc<IdentityManager<S>>,
        staging: Arc<CargoStagingStore>,
        courier: Arc<dyn CourierClient>,
        detector: Arc<dyn CourierDetector>,
        gateway_address: String,
    ) -> Self {
        let (state, _) = watch::channel(CourierSyncState::default());
        Self {
            codec,
            identity,
            staging,
            courier,
            detector,
            gateway_address,
            state,
            quiescent_wait: QUIESCENT_WAIT,
        }
    }

    /// Shorten the quiescent pause, for tests
    pub fn with_quiescent_wait(mut self, wait: StdDuration) -> Self {
        self.quiescent_wait = wait;
        self
    }

    /// Watch the run's phase transitions
    pub fn subscribe(&self) -> watch::Receiver<CourierSyncState> {
        self.state.subscribe()
    }

    /// Perform one full courier run
    ///
    /// A run that never reaches a live courier returns `NotReachable`
    /// without entering the error state; the node simply was not near a
    /// courier. Failures after the courier is engaged do set `Error`.
    pub async fn run(&self) -> Result<(), CourierSyncError> {
        self.state.send_replace(CourierSyncState::DeliveringCargo);

        let addr = match self.detector.detect().await {
            Some(addr) => addr,
            None => return Err(CourierSyncError::NotReachable),
        };
        // Visibility is not liveness; only a successful probe commits
        // the run
        if !self.courier.probe(addr).await {
            return Err(CourierSyncError::NotReachable);
        }
        info!(courier = %addr, "Courier run started");

        match self.run_engaged(addr).await {
            Ok(()) => {
                self.state.send_replace(CourierSyncState::Finished);
                info!(courier = %addr, "Courier run finished");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(CourierSyncState::Error);
                warn!(courier = %addr, error = %e, "Courier run failed");
                Err(e)
            }
        }
    }

    async fn run_engaged(&self, addr: std::net::SocketAddr) -> Result<(), CourierSyncError> {
        let containers = self
            .codec
            .generate(&self.gateway_address)
            .await
            .map_err(CourierSyncError::Relay)?;
        let mut delivered = 0usize;
        for cargo in &containers {
            // One refused container does not end the run; the parcels
            // stay queued for the next courier
            match self.courier.deliver_cargo(addr, cargo).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(error = %e, "Courier refused a cargo container"),
            }
        }
        info!(delivered, offered = containers.len(), "Delivered cargo");

        self.state.send_replace(CourierSyncState::Waiting);
        tokio::time::sleep(self.quiescent_wait).await;

        self.state.send_replace(CourierSyncState::CollectingCargo);
        let request = self.collection_request().await?;
        let received = self
            .courier
            .collect_cargo(addr, &request)
            .await
            .map_err(|e| CourierSyncError::Collection(e.to_string()))?;

        // Stage everything first so a crash mid-processing loses nothing
        for cargo in &received {
            self.staging
                .store(cargo)
                .await
                .map_err(RelayError::from)?;
        }
        for staged in self.staging.list().await.map_err(RelayError::from)? {
            let bytes = self.staging.read(&staged).await.map_err(RelayError::from)?;
            if let Err(e) = self.codec.process(&bytes).await {
                warn!(cargo = %staged.name, error = %e, "Failed to process staged cargo");
            }
            // Consumed regardless of outcome; a container that failed
            // validation will never start passing
            self.staging
                .delete(&staged)
                .await
                .map_err(RelayError::from)?;
        }
        Ok(())
    }

    /// Seal a cargo collection request carrying the cargo delivery
    /// authorization chain
    async fn collection_request(&self) -> Result<Vec<u8>, CourierSyncError> {
        let keys = self.identity.key_pair().await.map_err(RelayError::from)?;
        let chain = self
            .identity
            .cargo_delivery_auth()
            .await
            .map_err(RelayError::from)?;
        let envelope = Envelope::seal(
            EnvelopeKind::CargoCollectionRequest,
            &self.gateway_address,
            random_message_id(),
            Duration::minutes(COLLECTION_REQUEST_TTL_MINUTES),
            Vec::new(),
            chain,
            &keys,
        )
        .map_err(RelayError::from)?;
        Ok(envelope.to_bytes().map_err(RelayError::from)?)
    }
}
