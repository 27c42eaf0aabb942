//! System-surface tests: startup diagnostics and the route policy map.

mod common;

use axum::http::StatusCode;
use pretty_assertions::assert_eq;

use common::{Opts, send, test_router};

#[tokio::test]
async fn startup_diagnostics_report_shape() {
    let router = test_router();
    let (status, _, report) = send(
        &router,
        "GET",
        "/v1/system/startup-diagnostics",
        None,
        Opts::dev(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The report always carries the full check set and a summary, whatever
    // the surrounding process environment looks like.
    assert!(report["checks"].as_array().expect("checks").len() >= 6);
    assert!(report["required_env_vars"]
        .as_array()
        .expect("required")
        .iter()
        .any(|v| v == "AGENTHUB_IDENTITY_SIGNING_SECRET"));
    assert!(report["summary"]["severity_counts"].is_object());
    assert!(report["startup_ready"].is_boolean());
    assert!(report["overall_ready"].is_boolean());
}

#[tokio::test]
async fn route_policy_map_labels_every_route() {
    let router = test_router();
    let (status, _, body) = send(
        &router,
        "GET",
        "/v1/system/route-policy",
        None,
        Opts::dev(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let routes = body["routes"].as_array().expect("routes");
    assert!(routes.len() > 40);

    let lookup = |method: &str, path: &str| {
        routes
            .iter()
            .find(|row| row["method"] == method && row["path"] == path)
            .unwrap_or_else(|| panic!("row for {method} {path}"))
            .clone()
    };

    let healthz = lookup("GET", "/healthz");
    assert_eq!(healthz["classification"], "public");
    assert_eq!(healthz["requires_idempotency"], false);

    let register = lookup("POST", "/v1/identity/agents");
    assert_eq!(register["classification"], "tenant_scoped");
    assert_eq!(register["requires_idempotency"], true);

    let delegations = lookup("POST", "/v1/delegations");
    assert_eq!(delegations["classification"], "authenticated");
    // Delegation owns its durable reservation; the generic middleware skips it.
    assert_eq!(delegations["requires_idempotency"], false);

    let diagnostics = lookup("GET", "/v1/system/startup-diagnostics");
    assert_eq!(diagnostics["classification"], "admin_scoped");
}
