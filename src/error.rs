//! Error types for the AICP control plane

use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

/// Control-plane errors
///
/// This is the closed error set surfaced at the pipeline boundary. Handler
/// and storage failures are all expressed as one of these kinds; the HTTP
/// layer maps each kind to a status code and a stable envelope code via
/// [`Error::status_code`] and [`Error::envelope_code`].
#[derive(Error, Debug)]
pub enum Error {
    /// Entity lookup failed
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique identifier collision on insert
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic update lost the race (e.g. rotate-after-revoke)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Caller-supplied input violates a contract
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Authenticated caller is not allowed to perform the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No usable identity could be resolved from the request
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Estimated cost exceeds the delegation's hard budget ceiling
    #[error("hard ceiling exceeded: {0}")]
    HardCeiling(String),

    /// Circuit breaker refused admission of new delegations
    #[error("circuit breaker open")]
    BreakerOpen {
        /// Governance reasons reported by the SLO dashboard
        reasons: Vec<String>,
    },

    /// Configuration error (missing/invalid environment)
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying SQLite failure
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON (de)serialization failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status code for this error kind.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InvalidArgument(_) | Self::HardCeiling(_) => StatusCode::BAD_REQUEST,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_)
            | Self::Storage(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable envelope code for this error kind.
    #[must_use]
    pub fn envelope_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::HardCeiling(_) => "budget.hard_ceiling",
            Self::BreakerOpen { .. } => "breaker.open",
            Self::Config(_)
            | Self::Storage(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::Internal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Self::BreakerOpen { reasons } => serde_json::json!({
                "detail": {
                    "code": self.envelope_code(),
                    "message": self.to_string(),
                    "reasons": reasons,
                }
            }),
            _ => serde_json::json!({
                "detail": {
                    "code": self.envelope_code(),
                    "message": self.to_string(),
                }
            }),
        };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kinds() {
        assert_eq!(
            Error::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::AlreadyExists("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::InvalidArgument("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::PermissionDenied("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::Unauthenticated("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::BreakerOpen { reasons: vec![] }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn hard_ceiling_maps_to_budget_code() {
        let err = Error::HardCeiling("estimated cost above max budget".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.envelope_code(), "budget.hard_ceiling");
    }

    #[test]
    fn breaker_open_carries_reasons() {
        let err = Error::BreakerOpen {
            reasons: vec!["error_rate_open_threshold".into()],
        };
        assert_eq!(err.envelope_code(), "breaker.open");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
