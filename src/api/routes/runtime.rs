//! Runtime routes: capability quotas, IP rules, scope narrowing, and JIT
//! credentials.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::Result;
use crate::api::server::AppState;
use crate::identity::jit::DEFAULT_JIT_TTL_SECONDS;
use crate::runtime::ip_rules::RuleType;

// ── Quotas ────────────────────────────────────────────────────────────────

/// Request body for creating a quota.
#[derive(Debug, Deserialize)]
pub struct CreateQuotaRequest {
    /// Governed agent.
    pub agent_id: String,
    /// Governed resource.
    pub resource: String,
    /// Cap per window.
    pub max_value: i64,
    /// Rolling window length; 0 disables resets.
    #[serde(default)]
    pub period_seconds: i64,
    /// Operator note.
    #[serde(default)]
    pub description: String,
}

/// `POST /v1/runtime/quotas`
pub async fn create_quota(
    State(state): State<AppState>,
    Json(body): Json<CreateQuotaRequest>,
) -> Result<Response> {
    let quota = state.quotas.create(
        &body.agent_id,
        &body.resource,
        body.max_value,
        body.period_seconds,
        &body.description,
    )?;
    Ok((StatusCode::CREATED, Json(quota)).into_response())
}

/// Common list-query params.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Filter to one agent.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Filter to one resource.
    #[serde(default)]
    pub resource: Option<String>,
    /// Maximum rows returned.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `GET /v1/runtime/quotas`
pub async fn list_quotas(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let quotas = state.quotas.list(
        query.agent_id.as_deref(),
        query.resource.as_deref(),
        query.limit.unwrap_or(100),
    );
    Json(json!({"quotas": quotas, "total": quotas.len()}))
}

/// Request body for updating a quota.
#[derive(Debug, Deserialize)]
pub struct UpdateQuotaRequest {
    /// New cap.
    #[serde(default)]
    pub max_value: Option<i64>,
    /// New enabled bit.
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// `PATCH /v1/runtime/quotas/{quota_id}`
pub async fn update_quota(
    State(state): State<AppState>,
    Path(quota_id): Path<String>,
    Json(body): Json<UpdateQuotaRequest>,
) -> Result<Response> {
    let quota = state.quotas.update(&quota_id, body.max_value, body.enabled)?;
    Ok(Json(quota).into_response())
}

/// Request body for a quota check.
#[derive(Debug, Deserialize)]
pub struct QuotaCheckRequest {
    /// Checked agent.
    pub agent_id: String,
    /// Checked resource.
    pub resource: String,
    /// Units requested.
    #[serde(default = "default_amount")]
    pub amount: i64,
}

fn default_amount() -> i64 {
    1
}

/// `POST /v1/runtime/quotas/check`
pub async fn check_quota(
    State(state): State<AppState>,
    Json(body): Json<QuotaCheckRequest>,
) -> Json<serde_json::Value> {
    let check = state.quotas.check(&body.agent_id, &body.resource, body.amount);
    Json(serde_json::to_value(check).unwrap_or_else(|_| json!({})))
}

/// `GET /v1/runtime/quotas/usage`
pub async fn quota_usage(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let agent_id = query.agent_id.unwrap_or_default();
    let usage = state.quotas.usage(&agent_id, query.resource.as_deref());
    Json(json!({"agent_id": agent_id, "usage": usage, "total": usage.len()}))
}

/// `GET /v1/runtime/quotas/violations`
pub async fn quota_violations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let violations = state
        .quotas
        .violations(query.agent_id.as_deref(), query.limit.unwrap_or(100));
    Json(json!({"violations": violations, "total": violations.len()}))
}

/// `GET /v1/runtime/quotas/stats`
pub async fn quota_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.quotas.stats()).unwrap_or_else(|_| json!({})))
}

// ── IP rules ──────────────────────────────────────────────────────────────

/// Request body for creating an IP rule.
#[derive(Debug, Deserialize)]
pub struct CreateIpRuleRequest {
    /// Governed agent.
    pub agent_id: String,
    /// Operator label.
    pub name: String,
    /// Allow or deny.
    pub rule_type: RuleType,
    /// CIDR blocks.
    pub cidrs: Vec<String>,
    /// Operator note.
    #[serde(default)]
    pub description: String,
}

/// `POST /v1/runtime/ip-rules`
pub async fn create_ip_rule(
    State(state): State<AppState>,
    Json(body): Json<CreateIpRuleRequest>,
) -> Result<Response> {
    let rule = state.ip_rules.create(
        &body.agent_id,
        &body.name,
        body.rule_type,
        body.cidrs,
        &body.description,
    )?;
    Ok((StatusCode::CREATED, Json(rule)).into_response())
}

/// `GET /v1/runtime/ip-rules`
pub async fn list_ip_rules(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let rules = state
        .ip_rules
        .list(query.agent_id.as_deref(), None, query.limit.unwrap_or(100));
    Json(json!({"rules": rules, "total": rules.len()}))
}

/// Request body for an IP check.
#[derive(Debug, Deserialize)]
pub struct IpCheckRequest {
    /// Checked agent.
    pub agent_id: String,
    /// Checked address.
    pub ip_address: String,
}

/// `POST /v1/runtime/ip-rules/check`
pub async fn check_ip(
    State(state): State<AppState>,
    Json(body): Json<IpCheckRequest>,
) -> Result<Response> {
    let check = state.ip_rules.check(&body.agent_id, &body.ip_address)?;
    Ok(Json(check).into_response())
}

/// `POST /v1/runtime/ip-rules/{rule_id}/disable`
pub async fn disable_ip_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> Result<Response> {
    let rule = state.ip_rules.disable(&rule_id)?;
    Ok(Json(rule).into_response())
}

/// `GET /v1/runtime/ip-rules/log`
pub async fn ip_access_log(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let entries = state
        .ip_rules
        .access_log(query.agent_id.as_deref(), query.limit.unwrap_or(100));
    Json(json!({"entries": entries, "total": entries.len()}))
}

/// `GET /v1/runtime/ip-rules/stats`
pub async fn ip_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.ip_rules.stats()).unwrap_or_else(|_| json!({})))
}

// ── Scope narrowing ───────────────────────────────────────────────────────

/// Request body for narrowing scopes.
#[derive(Debug, Deserialize)]
pub struct NarrowScopeRequest {
    /// Token or credential being narrowed.
    pub parent_token_id: String,
    /// Scopes held by the parent.
    pub parent_scopes: Vec<String>,
    /// Requested subset.
    pub requested_scopes: Vec<String>,
    /// Requesting agent.
    pub agent_id: String,
    /// TTL of the narrowed token.
    #[serde(default = "default_narrow_ttl")]
    pub ttl_seconds: i64,
    /// Caller-supplied reason.
    #[serde(default)]
    pub reason: String,
}

fn default_narrow_ttl() -> i64 {
    3_600
}

/// `POST /v1/runtime/scope-narrowing`
pub async fn narrow_scope(
    State(state): State<AppState>,
    Json(body): Json<NarrowScopeRequest>,
) -> Result<Response> {
    let token = state.narrowing.narrow(
        &body.parent_token_id,
        &body.parent_scopes,
        &body.requested_scopes,
        &body.agent_id,
        body.ttl_seconds,
        &body.reason,
    )?;
    Ok((StatusCode::CREATED, Json(token)).into_response())
}

/// Request body for validating a narrowed token.
#[derive(Debug, Deserialize)]
pub struct ValidateNarrowedTokenRequest {
    /// Token to validate.
    pub token_id: String,
}

/// `POST /v1/runtime/scope-narrowing/validate`
pub async fn validate_narrowed_token(
    State(state): State<AppState>,
    Json(body): Json<ValidateNarrowedTokenRequest>,
) -> Json<serde_json::Value> {
    let verdict = state.narrowing.validate(&body.token_id);
    Json(serde_json::to_value(verdict).unwrap_or_else(|_| json!({})))
}

/// `DELETE /v1/runtime/scope-narrowing/{token_id}`
pub async fn revoke_narrowed_token(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> Result<Response> {
    let token = state.narrowing.revoke(&token_id)?;
    Ok(Json(token).into_response())
}

/// `GET /v1/runtime/scope-narrowing`
pub async fn list_narrowed_tokens(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let tokens = state
        .narrowing
        .list(query.agent_id.as_deref(), None, false, query.limit.unwrap_or(100));
    Json(json!({"tokens": tokens, "total": tokens.len()}))
}

/// `GET /v1/runtime/scope-narrowing/log`
pub async fn narrowing_log(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let entries = state
        .narrowing
        .log(query.agent_id.as_deref(), query.limit.unwrap_or(100));
    Json(json!({"entries": entries, "total": entries.len()}))
}

/// `GET /v1/runtime/scope-narrowing/stats`
pub async fn narrowing_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.narrowing.stats()).unwrap_or_else(|_| json!({})))
}

// ── JIT credentials ───────────────────────────────────────────────────────

/// Request body for issuing a JIT credential.
#[derive(Debug, Deserialize)]
pub struct IssueJitRequest {
    /// Bound agent.
    pub agent_id: String,
    /// Bound sandbox.
    pub sandbox_id: String,
    /// Granted scopes (defaults apply when absent).
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    /// Requested TTL.
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

/// `POST /v1/runtime/jit-credentials`
pub async fn issue_jit_credential(
    State(state): State<AppState>,
    Json(body): Json<IssueJitRequest>,
) -> Result<Response> {
    let jit = state.jit.issue(
        &body.agent_id,
        &body.sandbox_id,
        body.scopes.as_deref(),
        body.ttl_seconds.unwrap_or(DEFAULT_JIT_TTL_SECONDS),
    )?;
    Ok((StatusCode::CREATED, Json(jit)).into_response())
}

/// Request body for revoking a JIT credential.
#[derive(Debug, Deserialize)]
pub struct RevokeJitRequest {
    /// Sandbox the credential was bound to.
    pub sandbox_id: String,
    /// Revocation reason.
    #[serde(default = "default_jit_reason")]
    pub reason: String,
}

fn default_jit_reason() -> String {
    "sandbox_terminated".to_string()
}

/// `POST /v1/runtime/jit-credentials/{credential_id}/revoke`
pub async fn revoke_jit_credential(
    State(state): State<AppState>,
    Path(credential_id): Path<String>,
    Json(body): Json<RevokeJitRequest>,
) -> Result<Response> {
    let credential = state
        .jit
        .revoke(&credential_id, &body.sandbox_id, &body.reason)?;
    Ok(Json(credential).into_response())
}

/// Request body for sweeping a terminated sandbox.
#[derive(Debug, Deserialize)]
pub struct SandboxSweepRequest {
    /// Agent whose credentials are swept.
    pub agent_id: String,
}

/// `POST /v1/runtime/sandboxes/{sandbox_id}/sweep`
pub async fn sweep_sandbox(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
    Json(body): Json<SandboxSweepRequest>,
) -> Result<Response> {
    let sweep = state.jit.revoke_all_for_sandbox(&body.agent_id, &sandbox_id)?;
    Ok(Json(sweep).into_response())
}
