//! Authentication resolution and the access-policy middleware.
//!
//! Resolution priority: `X-API-Key` (owner map) → `Authorization: Bearer`
//! (HS256 token carrying owner + scopes) → `X-Delegation-Token` (token-store
//! verify; the subject becomes the acting identity with chain-attenuated
//! scopes). The access-policy middleware combines the resolved identity with
//! the route classification and tenant check, enforcing or warning per the
//! process mode.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::api::envelope::{append_warning_header, meter_warn, stable_error};
use crate::api::policy::{Classification, classify_route, evaluate_access, resolve_tenant_id};
use crate::api::server::AppState;
use crate::clock::utc_now_epoch;
use crate::config::AccessMode;
use crate::secrets::SigningSecrets;
use crate::{Error, Result};

/// Bearer token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerClaims {
    /// Owner principal the token acts as.
    pub owner: String,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Expiry (epoch seconds).
    pub exp: i64,
}

/// How the acting identity was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Opaque `X-API-Key` header.
    ApiKey,
    /// Signed bearer token.
    Bearer,
    /// Verified delegation token chain.
    DelegationToken,
}

/// Request identity stored on the request for downstream stages.
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    /// Resolved owner, when authentication succeeded.
    pub owner: Option<String>,
    /// Effective tenant for the request.
    pub tenant_id: String,
    /// Effective scopes of the acting identity.
    pub scopes: Vec<String>,
    /// Resolution method, when authenticated.
    pub auth_method: Option<AuthMethod>,
}

impl RequestIdentity {
    /// The owner, or an `UNAUTHENTICATED` error for handlers that need one.
    pub fn require_owner(&self) -> Result<&str> {
        self.owner
            .as_deref()
            .ok_or_else(|| Error::Unauthenticated("authentication required".to_string()))
    }
}

/// Mint a bearer token for `owner` with `scopes`, valid for `ttl_seconds`.
pub fn mint_bearer_token(
    secrets: &SigningSecrets,
    owner: &str,
    scopes: &[String],
    ttl_seconds: i64,
) -> Result<String> {
    let claims = BearerClaims {
        owner: owner.to_string(),
        scopes: scopes.to_vec(),
        exp: utc_now_epoch() + ttl_seconds,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secrets.auth_token.as_bytes()),
    )
    .map_err(|e| Error::Internal(format!("bearer token encoding failed: {e}")))
}

/// Verify a bearer token and return its claims.
pub fn verify_bearer_token(secrets: &SigningSecrets, token: &str) -> Result<BearerClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp"]);
    jsonwebtoken::decode::<BearerClaims>(
        token,
        &DecodingKey::from_secret(secrets.auth_token.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| Error::Unauthenticated(format!("invalid bearer token: {e}")))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Resolve the acting identity from the auth headers.
///
/// `Ok(None)` means no auth material was presented at all; an `Err` means
/// material was presented but did not verify.
pub fn resolve_identity(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<(String, AuthMethod, Vec<String>)>> {
    if let Some(api_key) = header_str(headers, "x-api-key") {
        let Some(owner) = state.config.owner_for_api_key(api_key) else {
            return Err(Error::Unauthenticated("invalid API key".to_string()));
        };
        return Ok(Some((
            owner.to_string(),
            AuthMethod::ApiKey,
            vec!["*".to_string()],
        )));
    }

    if let Some(authorization) = header_str(headers, "authorization") {
        let token = authorization
            .strip_prefix("Bearer ")
            .or_else(|| authorization.strip_prefix("bearer "))
            .ok_or_else(|| {
                Error::Unauthenticated("malformed Authorization header".to_string())
            })?;
        let claims = verify_bearer_token(&state.secrets, token)?;
        return Ok(Some((claims.owner, AuthMethod::Bearer, claims.scopes)));
    }

    if let Some(signed_token) = header_str(headers, "x-delegation-token") {
        let verification = state.tokens.verify(signed_token)?;
        // The subject becomes the acting identity; its owner carries the
        // tenant authority.
        let subject = state
            .identity_store
            .get_identity(&verification.subject_agent_id)?;
        return Ok(Some((
            subject.owner,
            AuthMethod::DelegationToken,
            verification.delegated_scopes,
        )));
    }

    Ok(None)
}

/// The access-policy middleware: classification → auth resolution → tenant
/// check, enforced or warned per the process mode.
pub async fn access_policy_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    // CORS preflight never carries auth headers.
    if request.method().as_str().eq_ignore_ascii_case("OPTIONS") {
        return next.run(request).await;
    }

    let method = request.method().as_str().to_ascii_uppercase();
    let path = request.uri().path().to_string();
    let tenant_id = resolve_tenant_id(header_str(request.headers(), "x-tenant-id"));
    let classification = classify_route(&method, &path);
    let mode = state.config.access_mode;

    let (identity, auth_error) = match resolve_identity(&state, request.headers()) {
        Ok(resolved) => (resolved, None),
        Err(err) => (None, Some(err)),
    };
    let owner = identity.as_ref().map(|(owner, _, _)| owner.clone());

    request.extensions_mut().insert(RequestIdentity {
        owner: owner.clone(),
        tenant_id: tenant_id.clone(),
        scopes: identity
            .as_ref()
            .map(|(_, _, scopes)| scopes.clone())
            .unwrap_or_default(),
        auth_method: identity.as_ref().map(|(_, method, _)| *method),
    });

    let violation = if auth_error.is_some() && classification != Classification::Public && owner.is_none()
    {
        Some((
            "auth.invalid",
            auth_error
                .as_ref()
                .map_or_else(|| "invalid credentials".to_string(), ToString::to_string),
        ))
    } else {
        evaluate_access(&state.config, classification, owner.as_deref(), &tenant_id)
            .map(|violation| (violation.code, violation.message.to_string()))
    };

    let Some((code, message)) = violation else {
        return next.run(request).await;
    };

    if mode == AccessMode::Enforce {
        let status = if matches!(code, "auth.required" | "auth.invalid") {
            StatusCode::UNAUTHORIZED
        } else {
            StatusCode::FORBIDDEN
        };
        return stable_error(status, code, &message);
    }

    let mut response = next.run(request).await;
    append_warning_header(&mut response, &format!("{code}:{message}"));
    meter_warn(
        owner.as_deref().unwrap_or("anonymous"),
        "access.warn",
        &method,
        &path,
        &tenant_id,
        code,
        &message,
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> SigningSecrets {
        SigningSecrets {
            auth_token: "bearer-signing-secret".to_string(),
            identity_signing: "identity".to_string(),
            provenance_signing: "prov".to_string(),
            policy_signing: "policy".to_string(),
        }
    }

    #[test]
    fn bearer_token_round_trips() {
        let secrets = secrets();
        let token = mint_bearer_token(
            &secrets,
            "owner-dev",
            &["delegation.create".to_string()],
            3600,
        )
        .expect("mint");
        let claims = verify_bearer_token(&secrets, &token).expect("verify");
        assert_eq!(claims.owner, "owner-dev");
        assert_eq!(claims.scopes, vec!["delegation.create"]);
    }

    #[test]
    fn expired_bearer_token_is_rejected() {
        let secrets = secrets();
        let token = mint_bearer_token(&secrets, "owner-dev", &[], -120).expect("mint");
        assert!(matches!(
            verify_bearer_token(&secrets, &token),
            Err(Error::Unauthenticated(_))
        ));
    }

    #[test]
    fn tampered_bearer_token_is_rejected() {
        let secrets = secrets();
        let token = mint_bearer_token(&secrets, "owner-dev", &[], 3600).expect("mint");
        let other = SigningSecrets {
            auth_token: "different-secret".to_string(),
            ..secrets
        };
        assert!(verify_bearer_token(&other, &token).is_err());
    }
}
