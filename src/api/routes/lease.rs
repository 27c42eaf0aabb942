//! Lease and install routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;

use crate::Result;
use crate::api::auth::RequestIdentity;
use crate::api::server::AppState;

/// Request body for acquiring a lease.
#[derive(Debug, Deserialize)]
pub struct CreateLeaseRequest {
    /// Requesting agent.
    pub requester_agent_id: String,
    /// Capability reference to lease.
    pub capability_ref: String,
    /// Requested TTL (seconds, must be positive).
    #[serde(default = "default_lease_ttl")]
    pub ttl_seconds: i64,
}

fn default_lease_ttl() -> i64 {
    3_600
}

/// `POST /v1/leases`
pub async fn create_lease(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Json(body): Json<CreateLeaseRequest>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let lease = state.leases.create_lease(
        &body.requester_agent_id,
        &body.capability_ref,
        owner,
        body.ttl_seconds,
    )?;
    Ok((StatusCode::CREATED, Json(lease)).into_response())
}

/// `GET /v1/leases/{lease_id}`
pub async fn get_lease(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Path(lease_id): Path<String>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let lease = state.leases.get_lease(&lease_id, owner)?;
    Ok(Json(lease).into_response())
}

/// Request body for promoting a lease.
#[derive(Debug, Deserialize)]
pub struct PromoteLeaseRequest {
    /// Signature binding the attestation hash to the owner.
    pub signature: String,
    /// Attestation hash returned at acquisition.
    pub attestation_hash: String,
    /// Policy approval flag.
    pub policy_approved: bool,
    /// Approval ticket (`APR-` prefix).
    pub approval_ticket: String,
    /// Compatibility verification flag.
    pub compatibility_verified: bool,
}

/// `POST /v1/leases/{lease_id}/promote`
pub async fn promote_lease(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Path(lease_id): Path<String>,
    Json(body): Json<PromoteLeaseRequest>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let lease = state.leases.promote_lease(
        &lease_id,
        owner,
        &body.signature,
        &body.attestation_hash,
        body.policy_approved,
        &body.approval_ticket,
        body.compatibility_verified,
    )?;
    Ok(Json(lease).into_response())
}

/// `GET /v1/installs/{install_id}`
pub async fn get_install(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Path(install_id): Path<String>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let install = state.leases.get_install(&install_id, owner)?;
    Ok(Json(install).into_response())
}

/// Request body for rolling back an install.
#[derive(Debug, Deserialize)]
pub struct RollbackInstallRequest {
    /// Reason recorded on the install.
    pub reason: String,
}

/// `POST /v1/installs/{install_id}/rollback`
pub async fn rollback_install(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Path(install_id): Path<String>,
    Json(body): Json<RollbackInstallRequest>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let install = state
        .leases
        .rollback_install(&install_id, owner, &body.reason)?;
    Ok(Json(install).into_response())
}
