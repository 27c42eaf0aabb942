//! Bearer token minting.

use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::Result;
use crate::api::auth::{RequestIdentity, mint_bearer_token};
use crate::api::server::AppState;
use crate::identity::normalize_scopes;

const MIN_TOKEN_TTL_SECONDS: i64 = 300;
const MAX_TOKEN_TTL_SECONDS: i64 = 86_400;

/// Request body for minting a bearer token.
#[derive(Debug, Deserialize)]
pub struct MintTokenRequest {
    /// Scopes the token should carry.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Requested TTL, clamped to [5 min, 1 day].
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

/// Mint a bearer token for the resolved owner.
pub async fn mint_token(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Json(body): Json<MintTokenRequest>,
) -> Result<Json<Value>> {
    let owner = identity.require_owner()?;
    let ttl = body
        .ttl_seconds
        .unwrap_or(3_600)
        .clamp(MIN_TOKEN_TTL_SECONDS, MAX_TOKEN_TTL_SECONDS);
    let scopes = normalize_scopes(&body.scopes);
    let token = mint_bearer_token(&state.secrets, owner, &scopes, ttl)?;
    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
        "owner": owner,
        "scopes": scopes,
        "expires_in": ttl,
    })))
}
