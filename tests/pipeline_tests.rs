//! End-to-end pipeline tests: classification, authentication resolution,
//! tenant scoping, enforcement modes, and idempotency reservations.

mod common;

use agenthub_aicp::api::server::build_router;
use agenthub_aicp::config::AccessMode;
use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{DEV_KEY, Opts, PARTNER_KEY, envelope_code, send, test_router};

#[tokio::test]
async fn healthz_is_public() {
    let router = test_router();
    let (status, _, body) = send(&router, "GET", "/healthz", None, Opts::default()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn v1_routes_require_authentication() {
    let router = test_router();
    let (status, _, body) = send(
        &router,
        "GET",
        "/v1/delegations/contract",
        None,
        Opts::default(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(envelope_code(&body), "auth.required");
}

#[tokio::test]
async fn invalid_api_key_is_auth_invalid() {
    let router = test_router();
    let (status, _, body) = send(
        &router,
        "GET",
        "/v1/delegations/contract",
        None,
        Opts {
            api_key: Some("not-a-registered-key"),
            ..Opts::default()
        },
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(envelope_code(&body), "auth.invalid");
}

#[tokio::test]
async fn admin_routes_reject_non_admin_owners() {
    let router = test_router();
    let (status, _, body) = send(
        &router,
        "GET",
        "/v1/system/startup-diagnostics",
        None,
        Opts {
            api_key: Some(PARTNER_KEY),
            ..Opts::default()
        },
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(envelope_code(&body), "auth.admin_required");

    let (status, _, _) = send(
        &router,
        "GET",
        "/v1/system/startup-diagnostics",
        None,
        Opts::dev(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn tenant_scope_is_enforced_per_owner_map() {
    let router = test_router();

    // owner-partner may act in tenant-partner but not in arbitrary tenants.
    let (status, _, body) = send(
        &router,
        "GET",
        "/v1/identity/agents",
        None,
        Opts {
            api_key: Some(PARTNER_KEY),
            tenant_id: Some("tenant-other"),
            ..Opts::default()
        },
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(envelope_code(&body), "tenant.forbidden");

    let (status, _, _) = send(
        &router,
        "GET",
        "/v1/identity/agents",
        None,
        Opts {
            api_key: Some(PARTNER_KEY),
            tenant_id: Some("tenant-partner"),
            ..Opts::default()
        },
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Wildcard owners pass any tenant.
    let (status, _, _) = send(
        &router,
        "GET",
        "/v1/identity/agents",
        None,
        Opts {
            api_key: Some(DEV_KEY),
            tenant_id: Some("tenant-whatever"),
            ..Opts::default()
        },
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn bearer_token_carries_the_owner() {
    let router = test_router();
    let (status, _, minted) = send(
        &router,
        "POST",
        "/v1/auth/tokens",
        Some(json!({"scopes": ["delegation.create"]})),
        Opts::dev(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = minted["access_token"].as_str().expect("token").to_string();
    assert_eq!(minted["owner"], "owner-dev");

    let (status, _, _) = send(
        &router,
        "GET",
        "/v1/identity/agents",
        None,
        Opts {
            bearer: Some(&token),
            ..Opts::default()
        },
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn mutating_routes_require_an_idempotency_key() {
    let router = test_router();
    let (status, _, body) = send(
        &router,
        "POST",
        "/v1/identity/agents",
        Some(json!({"agent_id": "agent-nokey"})),
        Opts::dev(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(envelope_code(&body), "idempotency.missing_key");
}

#[tokio::test]
async fn identical_retry_replays_the_cached_response() {
    let router = test_router();
    let payload = json!({"agent_id": "agent-s4"});

    let (status, _, first) = send(
        &router,
        "POST",
        "/v1/identity/agents",
        Some(payload.clone()),
        Opts::dev_idem("K"),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Second identical POST: same body and status, replay marker set.
    let (status, headers, second) = send(
        &router,
        "POST",
        "/v1/identity/agents",
        Some(payload),
        Opts::dev_idem("K"),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        headers
            .get("x-agenthub-idempotent-replay")
            .and_then(|v| v.to_str().ok()),
        Some("true")
    );
    assert_eq!(first, second);

    // Third POST with the same key but a different body: deterministic 409.
    let (status, _, body) = send(
        &router,
        "POST",
        "/v1/identity/agents",
        Some(json!({"agent_id": "agent-s4-other"})),
        Opts::dev_idem("K"),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        envelope_code(&body),
        "idempotency.key_reused_with_different_payload"
    );
}

#[tokio::test]
async fn failed_responses_are_not_cached() {
    let router = test_router();
    common::register_agent(&router, "agent-retry").await;

    // Re-registering the same agent collides with 409; the reservation is
    // cleared, so the same key is usable for a corrected payload.
    let (status, _, _) = send(
        &router,
        "POST",
        "/v1/identity/agents",
        Some(json!({"agent_id": "agent-retry"})),
        Opts::dev_idem("retry-key"),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, _) = send(
        &router,
        "POST",
        "/v1/identity/agents",
        Some(json!({"agent_id": "agent-retry-2"})),
        Opts::dev_idem("retry-key"),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn requests_carry_a_request_id() {
    let router = test_router();
    let (_, headers, _) = send(&router, "GET", "/healthz", None, Opts::default()).await;
    assert!(headers.contains_key("x-request-id"));

    // A caller-supplied id is echoed back.
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/healthz")
                .header("x-request-id", "req-fixed-42")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-fixed-42")
    );
}

#[tokio::test]
async fn warn_mode_proceeds_with_a_warning_header() {
    let mut config = common::test_config();
    config.access_mode = AccessMode::Warn;
    let state = agenthub_aicp::api::server::AppState::in_memory(config, common::test_secrets())
        .expect("state");
    let router = build_router(state);

    // Unauthenticated access to a route that needs no owner: the violation
    // is recorded in the Warning header and the request proceeds.
    let (status, headers, _) = send(
        &router,
        "GET",
        "/v1/delegations/contract",
        None,
        Opts::default(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let warning = headers
        .get("warning")
        .and_then(|v| v.to_str().ok())
        .expect("warning header");
    assert!(warning.contains("auth.required"));
}
