//! Identity routes: agents, credentials, delegation tokens, revocation,
//! trusted domains, and attestations.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::Result;
use crate::api::auth::RequestIdentity;
use crate::api::server::AppState;
use crate::identity::DEFAULT_CREDENTIAL_TTL_SECONDS;
use crate::identity::store::NewIdentity;
use crate::identity::types::{CredentialType, IdentityStatus, TrustLevel};

// ── Agents ────────────────────────────────────────────────────────────────

/// Request body for registering an agent identity.
#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    /// Unique agent id.
    pub agent_id: String,
    /// Credential mechanism (defaults to `api_key`).
    #[serde(default)]
    pub credential_type: Option<CredentialType>,
    /// Optional on-behalf-of human principal.
    #[serde(default)]
    pub human_principal_id: Option<String>,
    /// Optional SHA-256 of the canonical manifest.
    #[serde(default)]
    pub configuration_checksum: Option<String>,
    /// Optional PEM public key.
    #[serde(default)]
    pub public_key_pem: Option<String>,
    /// Opaque metadata.
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// `POST /v1/identity/agents`
pub async fn register_agent(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Json(body): Json<RegisterAgentRequest>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let created = state.identity_store.register_identity(&NewIdentity {
        agent_id: body.agent_id,
        owner: owner.to_string(),
        credential_type: body.credential_type,
        human_principal_id: body.human_principal_id,
        configuration_checksum: body.configuration_checksum,
        public_key_pem: body.public_key_pem,
        metadata: body.metadata,
    })?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

/// `GET /v1/identity/agents`
pub async fn list_agents(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let agents = state.identity_store.list_identities(owner)?;
    Ok(Json(json!({"agents": agents, "total": agents.len()})).into_response())
}

/// `GET /v1/identity/agents/{agent_id}`
pub async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Response> {
    let agent = state.identity_store.get_identity(&agent_id)?;
    Ok(Json(agent).into_response())
}

/// Request body for a status update.
#[derive(Debug, Deserialize)]
pub struct UpdateAgentStatusRequest {
    /// New status.
    pub status: IdentityStatus,
}

/// `PATCH /v1/identity/agents/{agent_id}`
pub async fn update_agent_status(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Path(agent_id): Path<String>,
    Json(body): Json<UpdateAgentStatusRequest>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let existing = state.identity_store.get_identity(&agent_id)?;
    if existing.owner != owner {
        return Err(crate::Error::PermissionDenied("owner mismatch".to_string()));
    }
    let updated = state
        .identity_store
        .update_identity_status(&agent_id, body.status)?;
    Ok(Json(updated).into_response())
}

// ── Credentials ───────────────────────────────────────────────────────────

/// Request body for issuing a credential.
#[derive(Debug, Deserialize)]
pub struct IssueCredentialRequest {
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Requested TTL (clamped).
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

/// `POST /v1/identity/agents/{agent_id}/credentials`
pub async fn issue_credential(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Path(agent_id): Path<String>,
    Json(body): Json<IssueCredentialRequest>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let issued = state.credentials.issue(
        &agent_id,
        &body.scopes,
        body.ttl_seconds.unwrap_or(DEFAULT_CREDENTIAL_TTL_SECONDS),
        owner,
    )?;
    Ok((StatusCode::CREATED, Json(issued)).into_response())
}

/// Request body for verifying a presented secret.
#[derive(Debug, Deserialize)]
pub struct VerifyCredentialRequest {
    /// The plaintext secret.
    pub secret: String,
}

/// `POST /v1/identity/credentials/verify`
pub async fn verify_credential(
    State(state): State<AppState>,
    Json(body): Json<VerifyCredentialRequest>,
) -> Result<Response> {
    let verification = state.credentials.verify(&body.secret)?;
    Ok(Json(verification).into_response())
}

/// Request body for rotating a credential.
#[derive(Debug, Default, Deserialize)]
pub struct RotateCredentialRequest {
    /// Replacement scopes (defaults to the old credential's).
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    /// Replacement TTL (clamped).
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

/// `POST /v1/identity/credentials/{credential_id}/rotate`
pub async fn rotate_credential(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Path(credential_id): Path<String>,
    body: Option<Json<RotateCredentialRequest>>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let rotated = state.credentials.rotate(
        &credential_id,
        owner,
        body.scopes.as_deref(),
        body.ttl_seconds,
    )?;
    Ok((StatusCode::CREATED, Json(rotated)).into_response())
}

/// Optional body for revoking a credential.
#[derive(Debug, Default, Deserialize)]
pub struct RevokeCredentialRequest {
    /// Reason recorded on the credential.
    #[serde(default)]
    pub reason: Option<String>,
}

/// `DELETE /v1/identity/credentials/{credential_id}`
pub async fn revoke_credential(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Path(credential_id): Path<String>,
    body: Option<Json<RevokeCredentialRequest>>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let reason = body
        .and_then(|Json(body)| body.reason)
        .unwrap_or_else(|| "manual_revocation".to_string());
    let revoked = state.credentials.revoke(&credential_id, owner, &reason)?;
    Ok(Json(revoked).into_response())
}

// ── Delegation tokens ─────────────────────────────────────────────────────

/// Request body for issuing a delegation token.
#[derive(Debug, Deserialize)]
pub struct IssueDelegationTokenRequest {
    /// Granting agent.
    pub issuer_agent_id: String,
    /// Acting agent.
    pub subject_agent_id: String,
    /// Requested scopes (attenuated).
    pub delegated_scopes: Vec<String>,
    /// Requested TTL (clamped, capped by the parent).
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    /// Parent edge, absent at the root.
    #[serde(default)]
    pub parent_token_id: Option<String>,
}

/// `POST /v1/identity/delegation-tokens`
pub async fn issue_delegation_token(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Json(body): Json<IssueDelegationTokenRequest>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let issued = state.tokens.issue(
        &body.issuer_agent_id,
        &body.subject_agent_id,
        &body.delegated_scopes,
        body.ttl_seconds.unwrap_or(DEFAULT_CREDENTIAL_TTL_SECONDS),
        body.parent_token_id.as_deref(),
        owner,
    )?;
    Ok((StatusCode::CREATED, Json(issued)).into_response())
}

/// Request body for verifying a signed delegation token.
#[derive(Debug, Deserialize)]
pub struct VerifyDelegationTokenRequest {
    /// Signed wire form `<token_id>.<hex_sig>`.
    pub signed_token: String,
}

/// `POST /v1/identity/delegation-tokens/verify`
pub async fn verify_delegation_token(
    State(state): State<AppState>,
    Json(body): Json<VerifyDelegationTokenRequest>,
) -> Result<Response> {
    let verification = state.tokens.verify(&body.signed_token)?;
    Ok(Json(verification).into_response())
}

/// `GET /v1/identity/delegation-tokens/{token_id}/chain`
pub async fn delegation_token_chain(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> Result<Response> {
    let chain = state.tokens.get_chain(&token_id)?;
    Ok(Json(chain).into_response())
}

/// `DELETE /v1/identity/delegation-tokens/{token_id}`
pub async fn revoke_delegation_token(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Path(token_id): Path<String>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let revocation = state.tokens.revoke(&token_id, owner)?;
    Ok(Json(revocation).into_response())
}

// ── Revocation orchestrator ───────────────────────────────────────────────

/// Optional body for the kill switch.
#[derive(Debug, Default, Deserialize)]
pub struct RevokeAgentRequest {
    /// Reason recorded on every cascaded record.
    #[serde(default)]
    pub reason: Option<String>,
}

/// `POST /v1/identity/agents/{agent_id}/revoke`
pub async fn revoke_agent(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Path(agent_id): Path<String>,
    body: Option<Json<RevokeAgentRequest>>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let reason = body
        .and_then(|Json(body)| body.reason)
        .unwrap_or_else(|| "manual_revocation".to_string());
    let summary = state.revocation.revoke_agent(&agent_id, owner, &reason)?;
    Ok(Json(summary).into_response())
}

/// Request body for the bulk kill switch.
#[derive(Debug, Deserialize)]
pub struct BulkRevokeRequest {
    /// Agents to revoke.
    pub agent_ids: Vec<String>,
    /// Reason recorded on every cascaded record.
    #[serde(default)]
    pub reason: Option<String>,
}

/// `POST /v1/identity/revocations/bulk`
pub async fn bulk_revoke(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Json(body): Json<BulkRevokeRequest>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let reason = body.reason.unwrap_or_else(|| "security_incident".to_string());
    let outcome = state.revocation.bulk_revoke(&body.agent_ids, owner, &reason);
    Ok(Json(outcome).into_response())
}

/// Query params for the revocation event log.
#[derive(Debug, Default, Deserialize)]
pub struct RevocationEventsQuery {
    /// Filter to one agent.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Maximum events returned.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `GET /v1/identity/revocations`
pub async fn list_revocation_events(
    State(state): State<AppState>,
    Query(query): Query<RevocationEventsQuery>,
) -> Result<Response> {
    let events = state
        .revocation
        .list_events(query.agent_id.as_deref(), query.limit.unwrap_or(100))?;
    Ok(Json(json!({"events": events, "total": events.len()})).into_response())
}

// ── Trusted domains & attestations ────────────────────────────────────────

/// Request body for registering a trusted domain.
#[derive(Debug, Deserialize)]
pub struct RegisterDomainRequest {
    /// Domain id.
    pub domain_id: String,
    /// Display name.
    pub display_name: String,
    /// Trust level (defaults to verified).
    #[serde(default)]
    pub trust_level: Option<TrustLevel>,
    /// Optional PEM public key.
    #[serde(default)]
    pub public_key_pem: Option<String>,
    /// Scopes the domain may attest for.
    #[serde(default)]
    pub allowed_scopes: Vec<String>,
}

/// `POST /v1/identity/domains`
pub async fn register_domain(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Json(body): Json<RegisterDomainRequest>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let domain = state.federation.register_domain(
        &body.domain_id,
        &body.display_name,
        body.trust_level.unwrap_or(TrustLevel::Verified),
        body.public_key_pem,
        body.allowed_scopes,
        owner,
    )?;
    Ok((StatusCode::CREATED, Json(domain)).into_response())
}

/// `GET /v1/identity/domains`
pub async fn list_domains(State(state): State<AppState>) -> Result<Response> {
    let domains = state.federation.list_domains()?;
    Ok(Json(json!({"domains": domains, "total": domains.len()})).into_response())
}

/// Request body for changing a domain's trust level.
#[derive(Debug, Deserialize)]
pub struct UpdateDomainRequest {
    /// New trust level.
    pub trust_level: TrustLevel,
}

/// `PATCH /v1/identity/domains/{domain_id}`
pub async fn update_domain(
    State(state): State<AppState>,
    Path(domain_id): Path<String>,
    Json(body): Json<UpdateDomainRequest>,
) -> Result<Response> {
    let domain = state
        .federation
        .set_domain_trust_level(&domain_id, body.trust_level)?;
    Ok(Json(domain).into_response())
}

/// Request body for creating an attestation.
#[derive(Debug, Deserialize)]
pub struct CreateAttestationRequest {
    /// Attested agent.
    pub agent_id: String,
    /// Binding domain.
    pub domain_id: String,
    /// String claims.
    #[serde(default)]
    pub claims: BTreeMap<String, String>,
    /// Requested TTL (clamped).
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

/// `POST /v1/identity/attestations`
pub async fn create_attestation(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Json(body): Json<CreateAttestationRequest>,
) -> Result<Response> {
    let owner = identity.require_owner()?;
    let attestation = state.federation.create_attestation(
        &body.agent_id,
        &body.domain_id,
        body.claims,
        body.ttl_seconds.unwrap_or(DEFAULT_CREDENTIAL_TTL_SECONDS),
        owner,
    )?;
    Ok((StatusCode::CREATED, Json(attestation)).into_response())
}

/// `POST /v1/identity/attestations/{attestation_id}/verify`
pub async fn verify_attestation(
    State(state): State<AppState>,
    Path(attestation_id): Path<String>,
) -> Result<Response> {
    let verification = state.federation.verify_attestation(&attestation_id)?;
    Ok(Json(verification).into_response())
}
