//! Production middleware: request-id injection, request logging, and the
//! cross-cutting request timeout.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::envelope::stable_error;
use crate::api::server::AppState;

/// Paths exempt from the timeout (they must stay responsive during stalls).
const TIMEOUT_EXEMPT: &[&str] = &["/healthz"];

/// Inject `X-Request-ID` and log request/response metadata.
pub async fn request_logging_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
        .unwrap_or_else(|| {
            let hex = Uuid::new_v4().simple().to_string();
            hex[..16].to_string()
        });

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let start = Instant::now();
    let mut response = next.run(request).await;
    #[allow(clippy::cast_precision_loss)]
    let duration_ms = (start.elapsed().as_micros() as f64 / 10.0).round() / 100.0;

    if let Ok(header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", header);
    }

    let status = response.status().as_u16();
    if status >= 500 {
        error!(request_id, %method, path, status, duration_ms, "request completed");
    } else if status >= 400 {
        warn!(request_id, %method, path, status, duration_ms, "request completed");
    } else {
        info!(request_id, %method, path, status, duration_ms, "request completed");
    }
    response
}

/// Request id stored on the request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Fail requests past the configured bound with 504.
pub async fn timeout_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if TIMEOUT_EXEMPT.contains(&path) {
        return next.run(request).await;
    }

    let limit = Duration::from_secs(state.config.request_timeout_seconds);
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => stable_error(
            StatusCode::GATEWAY_TIMEOUT,
            "request.timeout",
            &format!(
                "request timed out after {}s",
                state.config.request_timeout_seconds
            ),
        ),
    }
}
