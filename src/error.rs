//! Error handling and JSON error responses for the proxy

use crate::runtime::RuntimeError;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Boxed error type used for proxied response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type shared by every response the server produces. Unsync
/// because streamed upstream bodies are not Sync; hyper does not need
/// them to be.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Crate-wide error type.
///
/// Each variant maps to a well-defined HTTP status on the administrative
/// API; the proxy path uses [`ProxyErrorCode`] instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown service name or unknown host.
    #[error("{0}")]
    NotFound(String),
    /// Unique-key violation (service name, host, or container name).
    #[error("{0}")]
    Conflict(String),
    /// Malformed duration, URL, time, mode, or missing required field.
    #[error("{0}")]
    InvalidInput(String),
    /// A service was asked to start but has no containers configured.
    #[error("service {0} has no containers")]
    NoContainers(String),
    /// Container runtime call failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// TCP or HTTP readiness probe exceeded the startup timeout.
    #[error("backend {target} not ready within {timeout:?}: {detail}")]
    ReadinessTimeout {
        target: String,
        timeout: Duration,
        detail: String,
    },
    /// Operation cancelled or out of time budget.
    #[error("operation cancelled")]
    Cancelled,
    /// Config save failed.
    #[error("failed to persist config: {0}")]
    Persist(String),
}

impl Error {
    /// HTTP status for this error on the administrative API.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::NoContainers(_)
            | Error::Runtime(_)
            | Error::ReadinessTimeout { .. }
            | Error::Cancelled
            | Error::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error codes surfaced on the proxy path
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No service is configured for the requested host
    UnknownHost,
    /// The service has been administratively disabled
    ServiceDisabled,
    /// The service's schedule keeps it down right now
    DisabledBySchedule,
    /// Waking the backend containers failed
    WakeFailed,
    /// The service has no target URL to forward to
    NoTargetConfigured,
    /// Dispatching the request to the backend failed
    UpstreamFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownHost => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::ServiceDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::DisabledBySchedule => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::WakeFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::NoTargetConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::ServiceDisabled => "SERVICE_DISABLED",
            ProxyErrorCode::DisabledBySchedule => "DISABLED_BY_SCHEDULE",
            ProxyErrorCode::WakeFailed => "WAKE_FAILED",
            ProxyErrorCode::NoTargetConfigured => "NO_TARGET_CONFIGURED",
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a full (non-streaming) body from bytes.
pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_status_codes() {
        assert_eq!(
            ProxyErrorCode::UnknownHost.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::ServiceDisabled.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::DisabledBySchedule.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::WakeFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::NoTargetConfigured.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_admin_error_status_codes() {
        assert_eq!(
            Error::NotFound("service x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Conflict("host already used".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::InvalidInput("invalid mode".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Persist("disk full".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownHost, "unknown host: example.com");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_HOST\""));
        assert!(json.contains("\"message\":\"unknown host: example.com\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::WakeFailed, "backend unavailable");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "WAKE_FAILED"
        );
    }
}
