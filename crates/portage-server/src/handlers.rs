//! HTTP handlers of the control API
//!
//! All bodies are JSON except parcel submission, which takes the sealed
//! parcel bytes directly under its dedicated content type. Binary
//! values inside JSON (keys, authorizations, certificate chains) travel
//! hex-encoded.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use portage_core::{LocalEndpoint, PARCEL_CONTENT_TYPE, PrivateAddress, RecipientLocation, RegistrationState};
use portage_crypto::{Certificate, CredentialStore, KeyBytes};
use portage_relay::IngestOutcome;

use crate::auth::SignedAuthorization;
use crate::error::ApiError;
use crate::state::AppState;

/// Validity window of an endpoint certificate
pub const ENDPOINT_CERT_VALIDITY_DAYS: i64 = 180;

#[derive(Debug, Deserialize)]
pub struct PreRegistrationRequest {
    /// Endpoint public key, hex
    pub public_key: String,
    /// Application the endpoint will register under
    pub application_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreRegistrationResponse {
    /// Signed authorization to present with the registration, hex
    pub authorization: String,
}

#[derive(Debug, Deserialize)]
pub struct EndpointRegistrationRequest {
    pub public_key: String,
    pub authorization: String,
    pub application_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointRegistrationResponse {
    /// The endpoint's private address
    pub address: String,
    /// Leaf-first certificate chain rooting at the node identity, hex
    pub certificate_chain: String,
}

fn parse_key(hex_key: &str) -> Result<KeyBytes, ApiError> {
    let bytes = hex::decode(hex_key).map_err(|_| ApiError::bad_request("invalid key encoding"))?;
    bytes
        .try_into()
        .map_err(|_| ApiError::bad_request("key must be 32 bytes"))
}

pub async fn health<S: CredentialStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<Value>, ApiError> {
    let address = state.identity.node_address().await?;
    Ok(Json(json!({
        "status": "ok",
        "node_address": address.as_str(),
    })))
}

/// First half of endpoint registration: hand out a short-lived signed
/// authorization binding the presented key to its application
pub async fn pre_register<S: CredentialStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(request): Json<PreRegistrationRequest>,
) -> Result<Json<PreRegistrationResponse>, ApiError> {
    let endpoint_key = parse_key(&request.public_key)?;
    let keys = state.identity.key_pair().await?;
    let signed = SignedAuthorization::issue(&keys, endpoint_key, &request.application_id)?;
    Ok(Json(PreRegistrationResponse {
        authorization: hex::encode(signed.to_bytes()?),
    }))
}

/// Second half: burn the authorization, issue the endpoint certificate,
/// and record the endpoint
///
/// Refused outright while the node itself has not registered with the
/// public gateway; endpoints of an unregistered node could never relay.
pub async fn register_endpoint<S: CredentialStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(request): Json<EndpointRegistrationRequest>,
) -> Result<Json<EndpointRegistrationResponse>, ApiError> {
    if state.config.registration_state().await? != RegistrationState::Done {
        return Err(ApiError::conflict("node is not registered with a gateway"));
    }
    let endpoint_key = parse_key(&request.public_key)?;
    let authorization = hex::decode(&request.authorization)
        .map_err(|_| ApiError::bad_request("invalid authorization encoding"))?;

    let keys = state.identity.key_pair().await?;
    state
        .authorizations
        .verify(
            &authorization,
            &endpoint_key,
            &request.application_id,
            &keys.public_bytes(),
            Utc::now(),
        )
        .map_err(|e| ApiError::forbidden(e.to_string()))?;

    let certificate = Certificate::issue(
        endpoint_key,
        &keys,
        Duration::days(ENDPOINT_CERT_VALIDITY_DAYS),
    )?;
    let mut chain = vec![certificate];
    chain.extend(state.identity.identity_chain().await?);

    let address = PrivateAddress::derive(&endpoint_key);
    state
        .endpoints
        .register(LocalEndpoint {
            address: address.clone(),
            application_id: request.application_id.clone(),
        })
        .await?;
    info!(address = %address, application = request.application_id, "Endpoint registered");

    let chain_bytes =
        postcard::to_allocvec(&chain).map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(EndpointRegistrationResponse {
        address: address.as_str().to_string(),
        certificate_chain: hex::encode(chain_bytes),
    }))
}

/// Accept one sealed outbound parcel from a local endpoint
pub async fn submit_parcel<S: CredentialStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != PARCEL_CONTENT_TYPE {
        return Err(ApiError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("expected content type {PARCEL_CONTENT_TYPE}"),
        ));
    }

    let outcome = state
        .ingestor
        .ingest(&body, RecipientLocation::ExternalGateway)
        .await?;
    match outcome {
        // Duplicates are acknowledged too; the parcel is already queued
        IngestOutcome::Success(_) | IngestOutcome::Duplicate => {
            Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
        }
        IngestOutcome::Malformed => Err(ApiError::bad_request("parcel is malformed")),
        IngestOutcome::InvalidRecipient => {
            Err(ApiError::unprocessable("recipient address is invalid"))
        }
        IngestOutcome::Invalid(_) => Err(ApiError::unprocessable(
            "parcel failed signature or certificate validation",
        )),
    }
}
