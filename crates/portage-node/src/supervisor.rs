//! Wires the stores, engines, and control server into one daemon
//!
//! The supervisor owns the composition and the task lifecycle: it builds
//! everything over one redb database, performs the startup checks
//! (gateway migration, stale staging), then runs the control server, the
//! two keep-alive public sync directions, the periodic courier runs, and
//! the maintenance sweep until cancelled. A foreground/background signal
//! pauses the public sync directions, and a trigger channel requests a
//! courier run ahead of schedule.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, OnceCell, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use portage_core::RegistrationState;
use portage_crypto::IdentityManager;
use portage_relay::{
    CargoCodec, ConfiguredCourierDetector, CourierSyncEngine, CourierSyncError,
    DEFAULT_MAX_CARGO_SIZE, GatewayClient, HttpGatewayClient, ParcelIngestor, PublicSyncEngine,
    SyncMode, TcpCourierClient,
};
use portage_server::AppState;
use portage_store::{
    CargoStagingStore, CollectionRecordStore, Db, EndpointNotifier, EndpointRegistry,
    NodeConfigStore, ParcelStore, RedbCredentialStore,
};

use crate::config::NodeConfig;
use crate::error::NodeError;

/// Pause before retrying a failed keep-alive sync direction
const SYNC_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Run one keep-alive sync direction forever, reconnecting with backoff
///
/// The direction only runs while the activity signal reads true; flipping
/// it to false cancels the in-flight attempt, flipping it back starts a
/// fresh one.
async fn sync_loop<F, Fut>(
    direction: &'static str,
    token: CancellationToken,
    mut activity: watch::Receiver<bool>,
    connect: F,
) where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), portage_relay::RelayError>>,
{
    loop {
        while !*activity.borrow_and_update() {
            tokio::select! {
                _ = token.cancelled() => return,
                changed = activity.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
        let attempt = token.child_token();
        let result = tokio::select! {
            result = connect(attempt.clone()) => result,
            _ = token.cancelled() => return,
            paused = activity.wait_for(|active| !active) => {
                if paused.is_err() {
                    return;
                }
                attempt.cancel();
                debug!(direction, "Node backgrounded, pausing sync");
                continue;
            }
        };
        if token.is_cancelled() {
            return;
        }
        match result {
            Ok(()) => debug!(direction, "Sync direction ended, reconnecting"),
            Err(e) => debug!(direction, error = %e, "Sync direction failed"),
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(SYNC_RETRY_BACKOFF) => {}
        }
    }
}

/// Wait on the trigger channel if this task owns it, forever otherwise
async fn next_trigger(trigger: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match trigger {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub struct Supervisor {
    config: NodeConfig,
    state: Arc<AppState<RedbCredentialStore>>,
    public_sync: Arc<PublicSyncEngine<RedbCredentialStore>>,
    courier_sync: Arc<CourierSyncEngine<RedbCredentialStore>>,
    parcels: Arc<ParcelStore>,
    records: Arc<CollectionRecordStore>,
    node_config: Arc<NodeConfigStore>,
    identity: Arc<IdentityManager<RedbCredentialStore>>,
    staging: Arc<CargoStagingStore>,
    control_addr: OnceCell<SocketAddr>,
    activity: watch::Sender<bool>,
    courier_trigger: mpsc::Sender<()>,
    courier_trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Supervisor {
    pub async fn new(config: NodeConfig) -> Result<Self, NodeError> {
        if let Some(parent) = config.db_path().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Db::open(&config.db_path())?;
        let parcels = Arc::new(ParcelStore::open(db.clone(), config.blob_dir()).await?);
        let records = Arc::new(CollectionRecordStore::new(db.clone()));
        let endpoints = Arc::new(EndpointRegistry::new(db.clone()));
        let node_config = Arc::new(NodeConfigStore::new(db.clone()));
        let staging = Arc::new(CargoStagingStore::open(config.staging_dir()).await?);

        let identity = Arc::new(IdentityManager::new(RedbCredentialStore::new(db)));
        let keys = identity.key_pair().await?;
        info!(address = %keys.address(), "Node identity ready");

        let notifier = EndpointNotifier::new();
        let ingestor = Arc::new(ParcelIngestor::new(
            parcels.clone(),
            records.clone(),
            keys.public_bytes(),
        ));
        let codec = Arc::new(CargoCodec::new(
            parcels.clone(),
            records.clone(),
            identity.clone(),
            ingestor.clone(),
            notifier.clone(),
            DEFAULT_MAX_CARGO_SIZE,
        ));

        let gateway = Arc::new(HttpGatewayClient::new(&config.gateway_url));
        let public_sync = Arc::new(PublicSyncEngine::new(
            parcels.clone(),
            identity.clone(),
            node_config.clone(),
            ingestor.clone(),
            gateway.clone(),
            notifier.clone(),
        ));
        let courier_sync = Arc::new(CourierSyncEngine::new(
            codec,
            identity.clone(),
            staging.clone(),
            Arc::new(TcpCourierClient::new()),
            Arc::new(ConfiguredCourierDetector::new(config.courier_addr)),
            gateway.remote_address(),
        ));

        let state = Arc::new(AppState::new(
            identity.clone(),
            parcels.clone(),
            endpoints,
            node_config.clone(),
            ingestor,
            notifier,
        ));

        let (activity, _) = watch::channel(true);
        let (courier_trigger, courier_trigger_rx) = mpsc::channel(1);
        Ok(Self {
            config,
            state,
            public_sync,
            courier_sync,
            parcels,
            records,
            node_config,
            identity,
            staging,
            control_addr: OnceCell::new(),
            activity,
            courier_trigger,
            courier_trigger_rx: Mutex::new(Some(courier_trigger_rx)),
        })
    }

    /// Flip the foreground/background signal
    ///
    /// Backgrounding cancels the in-flight public sync attempts; they
    /// resume when the node comes back to the foreground.
    pub fn set_active(&self, active: bool) {
        self.activity.send_replace(active);
    }

    /// Ask for a courier run ahead of the next scheduled one
    pub fn trigger_courier_run(&self) {
        // A run is already pending if the channel is full
        let _ = self.courier_trigger.try_send(());
    }

    /// Where the control server actually bound, once running
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr.get().copied()
    }

    /// Detect a gateway change and drop state that only made sense under
    /// the old one
    ///
    /// Collection receipts deduplicate against the registered gateway's
    /// resend behavior; under a different gateway they would wrongly
    /// suppress parcels, so a migration purges them and forces a fresh
    /// registration.
    pub async fn check_gateway_migration(&self) -> Result<(), NodeError> {
        let Some(previous) = self.node_config.registered_gateway().await? else {
            return Ok(());
        };
        let current = HttpGatewayClient::new(&self.config.gateway_url).remote_address();
        if previous == current {
            return Ok(());
        }
        let purged = self.records.purge_all().await?;
        self.node_config
            .set_registration_state(RegistrationState::NotStarted)
            .await?;
        warn!(
            previous,
            current, purged, "Gateway changed; purged receipts and reset registration"
        );
        Ok(())
    }

    /// Run the daemon until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), NodeError> {
        self.check_gateway_migration().await?;
        let stale = self.staging.clear().await?;
        if stale > 0 {
            info!(stale, "Cleared leftover staged cargo");
        }

        let listener = TcpListener::bind(self.config.control_listen_addr).await?;
        let _ = self.control_addr.set(listener.local_addr()?);

        let tracker = TaskTracker::new();
        let server_state = self.state.clone();
        let server_shutdown = shutdown.child_token();
        tracker.spawn(async move {
            if let Err(e) = portage_server::serve(server_state, listener, server_shutdown).await {
                warn!(error = %e, "Control server stopped");
            }
        });

        let deliver_engine = self.public_sync.clone();
        let deliver_token = shutdown.child_token();
        tracker.spawn(sync_loop(
            "deliver",
            deliver_token,
            self.activity.subscribe(),
            move |token| {
                let engine = deliver_engine.clone();
                async move { engine.deliver(SyncMode::KeepAlive, &token).await }
            },
        ));
        let collect_engine = self.public_sync.clone();
        let collect_token = shutdown.child_token();
        tracker.spawn(sync_loop(
            "collect",
            collect_token,
            self.activity.subscribe(),
            move |token| {
                let engine = collect_engine.clone();
                async move { engine.collect(SyncMode::KeepAlive, &token).await }
            },
        ));

        let courier = self.courier_sync.clone();
        let courier_token = shutdown.child_token();
        let courier_interval = Duration::from_secs(self.config.courier_interval_secs);
        let mut trigger = self.courier_trigger_rx.lock().await.take();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = courier_token.cancelled() => return,
                    _ = tokio::time::sleep(courier_interval) => {}
                    Some(()) = next_trigger(&mut trigger) => {
                        info!("Courier run requested");
                    }
                }
                match courier.run().await {
                    Ok(()) => info!("Courier run complete"),
                    Err(CourierSyncError::NotReachable) => {
                        debug!("No courier in range");
                    }
                    Err(e) => warn!(error = %e, "Courier run failed"),
                }
            }
        });

        let supervisor = self.clone();
        let sweep_token = shutdown.child_token();
        let sweep_interval = Duration::from_secs(self.config.maintenance_interval_secs);
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = sweep_token.cancelled() => return,
                    _ = tokio::time::sleep(sweep_interval) => {}
                }
                if let Err(e) = supervisor.sweep().await {
                    warn!(error = %e, "Maintenance sweep failed");
                }
            }
        });

        tracker.close();
        shutdown.cancelled().await;
        info!("Shutting down");
        tracker.wait().await;
        Ok(())
    }

    /// One expiry sweep across parcels, receipts, nonces, and certificates
    pub async fn sweep(&self) -> Result<(), NodeError> {
        let now = Utc::now();
        let parcels = self.parcels.delete_expired(now).await?;
        let records = self.records.delete_expired(now).await?;
        let certificates = self.identity.delete_expired_certificates().await?;
        let nonces = self.state.authorizations.sweep(now);
        if parcels + records + certificates + nonces > 0 {
            info!(parcels, records, certificates, nonces, "Expiry sweep");
        }
        Ok(())
    }
}
