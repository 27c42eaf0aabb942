//! Delegation routes.
//!
//! `POST /v1/delegations` is excluded from the generic idempotency
//! middleware: it owns a durable reservation in the delegation store so the
//! at-most-once guarantee survives restarts. The handler reserves before the
//! orchestrator runs, finalizes with the response on success, and clears the
//! reservation on any failure so the client can retry with the same key.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::Result;
use crate::api::auth::RequestIdentity;
use crate::api::envelope::stable_error;
use crate::api::policy::resolve_tenant_id;
use crate::api::server::AppState;
use crate::config::AccessMode;
use crate::delegation::contract::DELEGATION_CONTRACT_V2;
use crate::delegation::service::CreateDelegation;
use crate::delegation::storage::ReservationState;
use crate::idempotency::request_hash;

/// Replay marker header.
const REPLAY_HEADER: &str = "x-agenthub-idempotent-replay";

/// `POST /v1/delegations`
pub async fn create_delegation(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let actor = identity.owner.clone().unwrap_or_else(|| "anonymous".to_string());
    let tenant_id = resolve_tenant_id(
        headers
            .get("x-tenant-id")
            .and_then(|value| value.to_str().ok()),
    );

    let key = headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string);

    let Some(key) = key else {
        if state.config.access_mode == AccessMode::Enforce {
            return Ok(stable_error(
                StatusCode::BAD_REQUEST,
                "idempotency.missing_key",
                "missing Idempotency-Key header",
            ));
        }
        // Warn mode: run without a reservation.
        let request: CreateDelegation = serde_json::from_slice(&body)
            .map_err(|e| crate::Error::InvalidArgument(format!("invalid request body: {e}")))?;
        let record = state.delegation.create(&request)?;
        return Ok(Json(record).into_response());
    };

    // The raw body bytes feed the hash so textually-different retries are
    // different payloads.
    let hash = request_hash("POST", "/v1/delegations", "", &body);
    match state
        .delegation_store
        .reserve_idempotency(&tenant_id, &actor, &key, &hash)?
    {
        ReservationState::Mismatch => {
            return Ok(stable_error(
                StatusCode::CONFLICT,
                "idempotency.key_reused_with_different_payload",
                "idempotency key reuse with different payload",
            ));
        }
        ReservationState::Pending => {
            return Ok(stable_error(
                StatusCode::CONFLICT,
                "idempotency.in_progress",
                "request with idempotency key is still in progress",
            ));
        }
        ReservationState::Response(cached) => {
            let mut response = Json(cached).into_response();
            response
                .headers_mut()
                .insert(REPLAY_HEADER, "true".parse().expect("static header value"));
            return Ok(response);
        }
        ReservationState::Reserved => {}
    }

    let outcome = serde_json::from_slice::<CreateDelegation>(&body)
        .map_err(|e| crate::Error::InvalidArgument(format!("invalid request body: {e}")))
        .and_then(|request| state.delegation.create(&request));

    match outcome {
        Ok(record) => {
            let response_json = serde_json::to_value(&record)?;
            state
                .delegation_store
                .finalize_idempotency(&tenant_id, &actor, &key, &response_json)?;
            Ok(Json(response_json).into_response())
        }
        Err(err) => {
            // Any failure clears the slot so the same key is retryable.
            state
                .delegation_store
                .clear_idempotency(&tenant_id, &actor, &key)?;
            Err(err)
        }
    }
}

/// `GET /v1/delegations/{delegation_id}/status`
pub async fn delegation_status(
    State(state): State<AppState>,
    Path(delegation_id): Path<String>,
) -> Result<Response> {
    match state.delegation.status(&delegation_id)? {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(crate::Error::NotFound(format!(
            "delegation not found: {delegation_id}"
        ))),
    }
}

/// `GET /v1/delegations/contract`
pub async fn delegation_contract() -> Json<Value> {
    Json(DELEGATION_CONTRACT_V2.clone())
}

/// Query params for the metering log.
#[derive(Debug, Default, Deserialize)]
pub struct MeteringQuery {
    /// Maximum events returned.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `GET /v1/delegations/metering`
pub async fn metering_events(
    State(state): State<AppState>,
    Query(query): Query<MeteringQuery>,
) -> Json<Value> {
    let events = state.delegation.metering_events(query.limit.unwrap_or(100));
    Json(json!({"events": events, "total": events.len()}))
}
