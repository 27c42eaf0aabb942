//! Shared fixtures for the integration suites: an in-memory control plane
//! behind the full middleware chain, plus a small request helper.

#![allow(dead_code)] // each suite uses a different subset of the fixtures

use agenthub_aicp::api::server::{AppState, build_router};
use agenthub_aicp::config::Config;
use agenthub_aicp::secrets::SigningSecrets;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

/// API key registered for `owner-dev` (admin).
pub const DEV_KEY: &str = "dev-owner-key";
/// API key registered for `owner-partner` (non-admin, two tenants).
pub const PARTNER_KEY: &str = "partner-owner-key";

pub fn test_secrets() -> SigningSecrets {
    SigningSecrets {
        auth_token: "test-auth-token-secret".to_string(),
        identity_signing: "test-identity-signing-secret".to_string(),
        provenance_signing: "test-provenance-secret".to_string(),
        policy_signing: "test-policy-secret".to_string(),
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config
        .api_keys
        .insert(DEV_KEY.to_string(), "owner-dev".to_string());
    config
        .api_keys
        .insert(PARTNER_KEY.to_string(), "owner-partner".to_string());
    config
}

pub fn test_state() -> AppState {
    AppState::in_memory(test_config(), test_secrets()).expect("in-memory state")
}

pub fn test_router() -> Router {
    build_router(test_state())
}

/// Request options beyond method/uri/body.
#[derive(Default)]
pub struct Opts<'a> {
    pub api_key: Option<&'a str>,
    pub bearer: Option<&'a str>,
    pub idempotency_key: Option<&'a str>,
    pub tenant_id: Option<&'a str>,
    pub delegation_token: Option<&'a str>,
}

impl<'a> Opts<'a> {
    pub fn dev() -> Self {
        Self {
            api_key: Some(DEV_KEY),
            ..Self::default()
        }
    }

    pub fn dev_idem(key: &'a str) -> Self {
        Self {
            api_key: Some(DEV_KEY),
            idempotency_key: Some(key),
            ..Self::default()
        }
    }
}

/// Drive one request through the router; returns status, headers, and the
/// parsed JSON body (Null when the body is empty or not JSON).
pub async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    opts: Opts<'_>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = opts.api_key {
        builder = builder.header("x-api-key", key);
    }
    if let Some(token) = opts.bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    if let Some(key) = opts.idempotency_key {
        builder = builder.header("idempotency-key", key);
    }
    if let Some(tenant) = opts.tenant_id {
        builder = builder.header("x-tenant-id", tenant);
    }
    if let Some(token) = opts.delegation_token {
        builder = builder.header("x-delegation-token", token);
    }

    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, json)
}

/// Register an agent owned by `owner-dev` through the API.
pub async fn register_agent(router: &Router, agent_id: &str) -> Value {
    let key = format!("register-{agent_id}");
    let (status, _, body) = send(
        router,
        "POST",
        "/v1/identity/agents",
        Some(serde_json::json!({"agent_id": agent_id})),
        Opts::dev_idem(&key),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register {agent_id}: {body}");
    body
}

/// The stable envelope code of an error body.
pub fn envelope_code(body: &Value) -> &str {
    body["detail"]["code"].as_str().unwrap_or_default()
}
