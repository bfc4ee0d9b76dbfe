//! Local control server of the Portage gateway node
//!
//! Binds on the loopback interface and exposes the control API to
//! applications on the same machine: endpoint registration, outbound
//! parcel submission, and the WebSocket collection channel. CORS is
//! permissive; proof of key ownership, not origin, is what gates every
//! sensitive operation.

pub mod auth;
pub mod collect;
pub mod error;
pub mod handlers;
pub mod state;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use portage_crypto::CredentialStore;

pub use auth::{AuthorizationVerifier, ENDPOINT_AUTH_TTL_SECONDS, SignedAuthorization};
pub use error::ApiError;
pub use handlers::ENDPOINT_CERT_VALIDITY_DAYS;
pub use state::AppState;

/// Build the control API router
pub fn router<S: CredentialStore + 'static>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/v1/health", get(handlers::health::<S>))
        .route("/v1/pre-registrations", post(handlers::pre_register::<S>))
        .route("/v1/endpoints", post(handlers::register_endpoint::<S>))
        .route("/v1/parcels", post(handlers::submit_parcel::<S>))
        .route("/v1/parcels/collect", get(collect::collect_ws::<S>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the control API until `shutdown` fires
pub async fn serve<S: CredentialStore + 'static>(
    state: Arc<AppState<S>>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Control server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
