//! SLO dashboard route.

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::Result;
use crate::api::server::AppState;
use crate::reliability::{DEFAULT_WINDOW_SIZE, SrePolicy, build_slo_dashboard};

/// Query params for the dashboard.
#[derive(Debug, Default, Deserialize)]
pub struct SloQuery {
    /// Evaluation window size.
    #[serde(default)]
    pub window_size: Option<usize>,
}

/// `GET /v1/reliability/slo`
pub async fn slo_dashboard(
    State(state): State<AppState>,
    Query(query): Query<SloQuery>,
) -> Result<Json<Value>> {
    let dashboard = build_slo_dashboard(
        &state.delegation_store,
        query.window_size.unwrap_or(DEFAULT_WINDOW_SIZE),
        &SrePolicy::default(),
    )?;
    Ok(Json(serde_json::to_value(dashboard).unwrap_or_else(|_| json!({}))))
}
