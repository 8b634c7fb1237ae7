//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the gateway's error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway.
///
/// Maps onto the error taxonomy used across the data plane: validation
/// failures never touch shared state, `NotFound` and `NoHealthyInstance`
/// are kept distinct per the registry's discovery contract, and
/// background tasks never let an `Error` escape upward -- they log and
/// continue (see `registry::health` and `ratelimit::sweeper`).
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Input validation failure (empty required field, out-of-range port,
    /// malformed regex, ...). No side effect has occurred.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Entity absent. Cache reads return it; registry mutations treat
    /// deregistering a missing entity as an idempotent no-op rather than
    /// surfacing this.
    #[error("not found: {0}")]
    NotFound(String),

    /// A service exists and has instances, but none are admissible
    /// (healthy and in an eligible instance status). Distinguished from
    /// `NotFound` so callers can tell "nothing registered" apart from
    /// "registered but currently unavailable".
    #[error("no healthy instance available for {0}")]
    NoHealthyInstance(String),

    /// Group delete with non-empty services, duplicate id on strict-mode
    /// register, or other invariant collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Tenant or access-control rejection.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authorization error distinct from authentication failure.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Upstream read/write or overall request deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Connect refused, TLS handshake failed, or 5xx from upstream after
    /// retries exhausted.
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    /// Admission rejected by the rate limiter. Carries the configured
    /// rejection status code and message so the filter chain can apply
    /// them verbatim.
    #[error("rate limited: {message}")]
    RateLimited { status: u16, message: String },

    /// JWT validation failure (the auth filter's underlying token check).
    #[error("JWT error: {0}")]
    Jwt(Box<jsonwebtoken::errors::Error>),

    /// NATS event-sink error (durable-store writer connectivity).
    #[cfg(feature = "events-nats")]
    #[error("NATS error: {0}")]
    Nats(String),

    /// HTTP error constructing a request/response.
    #[error("HTTP error: {0}")]
    Http(Box<axum::http::Error>),

    /// Upstream HTTP client error (connect, TLS, protocol).
    #[error("HTTP client error: {0}")]
    Reqwest(Box<reqwest::Error>),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not supported (e.g. a filter/algorithm variant the gateway does
    /// not implement at runtime).
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Invariant violation; logged at ERROR, surfaced as 500.
    #[error("internal error: {0}")]
    Internal(String),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Optional error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            status: status.as_u16(),
        }
    }

    /// Create error response with a code
    pub fn with_code(
        status: StatusCode,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            status: status.as_u16(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_response) = match self {
            Error::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::with_code(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    e.to_string(),
                ),
            ),

            Error::InvalidArgument(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_code(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", msg),
            ),

            Error::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_code(StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ),

            Error::NoHealthyInstance(ref service) => {
                tracing::debug!(service = %service, "no healthy instance for discovery");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorResponse::with_code(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "NO_HEALTHY_INSTANCE",
                        format!("no healthy instance available for {service}"),
                    ),
                )
            }

            Error::Conflict(msg) => (
                StatusCode::CONFLICT,
                ErrorResponse::with_code(StatusCode::CONFLICT, "CONFLICT", msg),
            ),

            Error::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::with_code(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ),

            Error::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                ErrorResponse::with_code(StatusCode::FORBIDDEN, "FORBIDDEN", msg),
            ),

            Error::Timeout(msg) => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorResponse::with_code(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg),
            ),

            Error::UpstreamFailure(msg) => {
                tracing::warn!("upstream failure: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorResponse::with_code(StatusCode::BAD_GATEWAY, "UPSTREAM_FAILURE", msg),
                )
            }

            Error::RateLimited { status, message } => {
                let code = StatusCode::from_u16(status).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
                (
                    code,
                    ErrorResponse::with_code(code, "RATE_LIMITED", message),
                )
            }

            Error::Jwt(e) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::with_code(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", e.to_string()),
            ),

            #[cfg(feature = "events-nats")]
            Error::Nats(e) => {
                tracing::error!("NATS error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "NATS_ERROR",
                        "event system error",
                    ),
                )
            }

            Error::Http(e) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_code(StatusCode::BAD_REQUEST, "HTTP_ERROR", e.to_string()),
            ),

            Error::Reqwest(e) => {
                tracing::warn!("upstream client error: {}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorResponse::with_code(
                        StatusCode::BAD_GATEWAY,
                        "UPSTREAM_FAILURE",
                        "upstream request failed",
                    ),
                )
            }

            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "IO_ERROR",
                        "I/O operation failed",
                    ),
                )
            }

            Error::NotSupported(msg) => (
                StatusCode::NOT_IMPLEMENTED,
                ErrorResponse::with_code(StatusCode::NOT_IMPLEMENTED, "NOT_SUPPORTED", msg),
            ),

            Error::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "internal server error",
                    ),
                )
            }

            Error::Other(msg) => {
                tracing::error!("unexpected error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "an unexpected error occurred",
                    ),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error::Jwt(Box::new(err))
    }
}

impl From<axum::http::Error> for Error {
    fn from(err: axum::http::Error) -> Self {
        Error::Http(Box::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Reqwest(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let err = ErrorResponse::new(StatusCode::NOT_FOUND, "instance not found");
        assert_eq!(err.status, 404);
        assert_eq!(err.error, "instance not found");
        assert!(err.code.is_none());
    }

    #[test]
    fn test_error_response_with_code() {
        let err = ErrorResponse::with_code(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            "tenantId is required",
        );
        assert_eq!(err.status, 400);
        assert_eq!(err.code, Some("INVALID_ARGUMENT".to_string()));
    }

    #[test]
    fn test_not_found_vs_no_healthy_instance_status() {
        let not_found = Error::NotFound("svc".into()).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let no_healthy = Error::NoHealthyInstance("svc".into()).into_response();
        assert_eq!(no_healthy.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_rate_limited_uses_configured_status() {
        let err = Error::RateLimited {
            status: 429,
            message: "too many requests".into(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
