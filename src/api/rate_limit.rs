//! Per-key rate limiting for the public surface.
//!
//! Requests are keyed by `X-API-Key`, falling back to the peer address so
//! unauthenticated probes share one bucket per source. Health and readiness
//! endpoints are exempt.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tracing::warn;

use crate::api::envelope::stable_error;

/// Paths exempt from rate limiting.
const EXEMPT_PREFIXES: &[&str] = &["/healthz", "/.well-known"];

/// Shared keyed limiter.
pub type ApiRateLimiter = Arc<DefaultKeyedRateLimiter<String>>;

/// Build the keyed limiter for `per_minute` requests.
#[must_use]
pub fn build_rate_limiter(per_minute: u32) -> ApiRateLimiter {
    let quota = Quota::per_minute(NonZeroU32::new(per_minute.max(1)).expect("max(1) is non-zero"));
    Arc::new(RateLimiter::keyed(quota))
}

/// Rate-limit middleware keyed by API key, else peer IP.
pub async fn rate_limit_middleware(
    State(limiter): State<ApiRateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if EXEMPT_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return next.run(request).await;
    }

    let key = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    if limiter.check_key(&key).is_err() {
        warn!(path, "rate limit exceeded");
        return stable_error(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit.exceeded",
            "rate limit exceeded",
        );
    }
    next.run(request).await
}
