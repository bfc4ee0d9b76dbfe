//! Shared state behind the control server

use std::sync::Arc;

use portage_crypto::{CredentialStore, IdentityManager};
use portage_relay::ParcelIngestor;
use portage_store::{EndpointNotifier, EndpointRegistry, NodeConfigStore, ParcelStore};

use crate::auth::AuthorizationVerifier;

/// Everything the handlers reach for
pub struct AppState<S: CredentialStore> {
    pub identity: Arc<IdentityManager<S>>,
    pub parcels: Arc<ParcelStore>,
    pub endpoints: Arc<EndpointRegistry>,
    pub config: Arc<NodeConfigStore>,
    pub ingestor: Arc<ParcelIngestor>,
    pub notifier: EndpointNotifier,
    pub authorizations: AuthorizationVerifier,
}

impl<S: CredentialStore> AppState<S> {
    pub fn new(
        identity: Arc<IdentityManager<S>>,
        parcels: Arc<ParcelStore>,
        endpoints: Arc<EndpointRegistry>,
        config: Arc<NodeConfigStore>,
        ingestor: Arc<ParcelIngestor>,
        notifier: EndpointNotifier,
    ) -> Self {
        Self {
            identity,
            parcels,
            endpoints,
            config,
            ingestor,
            notifier,
            authorizations: AuthorizationVerifier::new(),
        }
    }
}
