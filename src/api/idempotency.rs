//! Idempotency middleware for mutating `/v1/*` routes.
//!
//! The middleware reserves the `(tenant, actor, method, route, key)` slot
//! before the handler runs and fully buffers the handler response so the
//! cached copy and the wire copy are byte-identical. Responses < 300 are
//! cached for replay; anything else clears the reservation so a corrected
//! retry is accepted.

use std::collections::BTreeMap;

use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use crate::api::auth::RequestIdentity;
use crate::api::envelope::{append_warning_header, meter_warn, stable_error};
use crate::api::policy::{requires_idempotency, resolve_tenant_id};
use crate::api::server::AppState;
use crate::config::AccessMode;
use crate::idempotency::{CachedResponse, Reservation, SlotKey, request_hash};

/// Upper bound on buffered request/response bodies (16 MiB).
const BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Replay marker header.
const REPLAY_HEADER: &str = "x-agenthub-idempotent-replay";

fn replay_response(cached: &CachedResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(cached.status_code).unwrap_or(StatusCode::OK))
        .header("content-type", cached.content_type.clone());
    for (name, value) in &cached.headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder.header(REPLAY_HEADER, "true");
    builder
        .body(Body::from(cached.body.clone()))
        .unwrap_or_else(|_| {
            stable_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "cached response could not be reconstructed",
            )
        })
}

/// The idempotency middleware.
#[allow(clippy::too_many_lines)]
pub async fn idempotency_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_ascii_uppercase();
    let path = request.uri().path().to_string();
    if !requires_idempotency(&method, &path) {
        return next.run(request).await;
    }

    let mode = state.config.access_mode;
    let tenant_id = resolve_tenant_id(
        request
            .headers()
            .get("x-tenant-id")
            .and_then(|value| value.to_str().ok()),
    );
    let actor = request
        .extensions()
        .get::<RequestIdentity>()
        .and_then(|identity| identity.owner.clone())
        .unwrap_or_else(|| "anonymous".to_string());

    let key = request
        .headers()
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string);

    let Some(key) = key else {
        if mode == AccessMode::Enforce {
            return stable_error(
                StatusCode::BAD_REQUEST,
                "idempotency.missing_key",
                "missing Idempotency-Key header",
            );
        }
        let mut response = next.run(request).await;
        append_warning_header(
            &mut response,
            "idempotency.missing_key:missing Idempotency-Key header",
        );
        meter_warn(
            &actor,
            "idempotency.warn",
            &method,
            &path,
            &tenant_id,
            "idempotency.missing_key",
            "missing Idempotency-Key header",
        );
        return response;
    };

    // Buffer the raw body: the request hash covers the exact bytes.
    let (parts, body) = request.into_parts();
    let Ok(body_bytes) = to_bytes(body, BODY_LIMIT).await else {
        return stable_error(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            "request body could not be read",
        );
    };
    let raw_query = parts.uri.query().unwrap_or_default().to_string();
    let hash = request_hash(&method, &path, &raw_query, &body_bytes);

    let slot = SlotKey {
        tenant_id: &tenant_id,
        actor: &actor,
        method: &method,
        route: &path,
        idempotency_key: &key,
    };

    match state.idempotency.reserve(slot, &hash) {
        Ok(Reservation::Mismatch) => {
            return stable_error(
                StatusCode::CONFLICT,
                "idempotency.key_reused_with_different_payload",
                "idempotency key reuse with different payload",
            );
        }
        Ok(Reservation::Pending) => {
            return stable_error(
                StatusCode::CONFLICT,
                "idempotency.in_progress",
                "request with idempotency key is still in progress",
            );
        }
        Ok(Reservation::Response(cached)) => return replay_response(&cached),
        Ok(Reservation::Reserved) => {}
        Err(err) => {
            return stable_error(err.status_code(), err.envelope_code(), &err.to_string());
        }
    }

    // Run the handler with the buffered body re-attached.
    let request = Request::from_parts(parts, Body::from(body_bytes));
    let response = next.run(request).await;

    // Fully buffer the handler response so the cached copy and the wire
    // copy are identical and the body iterator is drained exactly once.
    let (mut response_parts, response_body) = response.into_parts();
    let Ok(response_bytes) = to_bytes(response_body, BODY_LIMIT).await else {
        let _ = state.idempotency.clear(slot);
        return stable_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            "response body could not be buffered",
        );
    };

    if response_parts.status.as_u16() < 300 {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in &response_parts.headers {
            if name.as_str().eq_ignore_ascii_case("content-length") {
                continue;
            }
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        let cached = CachedResponse {
            status_code: response_parts.status.as_u16(),
            content_type: response_parts
                .headers
                .get("content-type")
                .and_then(|value| value.to_str().ok())
                .unwrap_or("application/json")
                .to_string(),
            headers,
            body: response_bytes.to_vec(),
        };
        if let Err(err) = state.idempotency.finalize(slot, &cached) {
            tracing::warn!(error = %err, "idempotency finalize failed");
        }
    } else if let Err(err) = state.idempotency.clear(slot) {
        tracing::warn!(error = %err, "idempotency clear failed");
    }

    // Content-Length belongs to the buffered body now.
    response_parts.headers.remove(HeaderName::from_static("content-length"));
    if let Ok(len) = HeaderValue::from_str(&response_bytes.len().to_string()) {
        response_parts
            .headers
            .insert(HeaderName::from_static("content-length"), len);
    }
    Response::from_parts(response_parts, Body::from(response_bytes))
}
