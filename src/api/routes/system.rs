//! System routes: health, startup diagnostics, route policy map.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::api::policy::route_policy_map;
use crate::api::server::AppState;
use crate::diagnostics::build_startup_diagnostics;

use super::ROUTE_TABLE;

/// Liveness probe.
pub async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Admin-only readiness report over the live process environment.
pub async fn startup_diagnostics(State(state): State<AppState>) -> Json<Value> {
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let report = build_startup_diagnostics(&env, state.config.access_mode);
    Json(serde_json::to_value(report).unwrap_or_else(|_| json!({})))
}

/// Classification and idempotency requirement per route.
pub async fn route_policy() -> Json<Value> {
    let rows = route_policy_map(ROUTE_TABLE);
    Json(json!({"routes": rows}))
}
