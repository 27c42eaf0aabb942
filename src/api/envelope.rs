//! Stable error envelope and warn-mode plumbing.
//!
//! Every enforced failure carries `{"detail": {"code": .., "message": ..}}`
//! with a code from the closed pipeline set. In warn mode the violation is
//! appended to the `Warning` header instead and a metered warn event is
//! recorded through the structured log.

use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::warn;

/// Build an enforced-failure response with the stable envelope.
#[must_use]
pub fn stable_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "detail": {
                "code": code,
                "message": message,
            }
        })),
    )
        .into_response()
}

/// Append a warn-mode violation to the response's `Warning` header.
pub fn append_warning_header(response: &mut Response, warning: &str) {
    let value = match response.headers().get("warning") {
        Some(existing) => format!(
            "{}, {}",
            existing.to_str().unwrap_or_default(),
            warning
        ),
        None => warning.to_string(),
    };
    if let Ok(header) = HeaderValue::from_str(&value) {
        response.headers_mut().insert("warning", header);
    }
}

/// Record a metered warn event for a violation that was not enforced.
#[allow(clippy::too_many_arguments)]
pub fn meter_warn(
    actor: &str,
    kind: &str,
    method: &str,
    path: &str,
    tenant_id: &str,
    code: &str,
    message: &str,
) {
    warn!(
        actor,
        kind,
        method,
        path,
        tenant_id,
        code,
        message,
        "access violation recorded in warn mode"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape_is_stable() {
        let response = stable_error(StatusCode::FORBIDDEN, "tenant.forbidden", "nope");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn warnings_accumulate_in_one_header() {
        let mut response = stable_error(StatusCode::OK, "x", "y");
        append_warning_header(&mut response, "auth.required:authentication required");
        append_warning_header(&mut response, "idempotency.missing_key:missing key");
        let header = response
            .headers()
            .get("warning")
            .expect("header present")
            .to_str()
            .expect("ascii");
        assert!(header.contains("auth.required"));
        assert!(header.contains("idempotency.missing_key"));
    }
}
