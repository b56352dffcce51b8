//! Error types and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Errors raised while choosing or provisioning a backend
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool has been stopped and accepts no more work
    #[error("pool is stopped")]
    Stopped,
    /// No free local port could be obtained for a new backend
    #[error("failed to allocate a backend address: {0}")]
    AddressAllocation(#[source] std::io::Error),
    /// The cap is reached and every live backend is draining
    #[error("no backend available")]
    NoBackendAvailable,
}

/// Errors produced by a forward exchange
///
/// Every variant is answered locally with a synthetic response; none of them
/// is fatal to the proxy.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Routing failed before a backend was chosen
    #[error("no backend: {0}")]
    NoBackend(#[from] PoolError),
    /// The backend did not pass its health probe
    #[error("backend {address} is unhealthy")]
    Unhealthy { address: String },
    /// The backend HTTP call failed
    #[error("failed to forward to {address}: {source}")]
    Transport {
        address: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },
    /// The request could not be rewritten for the backend
    #[error("cannot address {address}: {source}")]
    InvalidRequest {
        address: String,
        #[source]
        source: hyper::http::Error,
    },
    /// No response arrived within the forward timeout
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// The backend channel was torn down before a response arrived
    #[error("backend {address} closed")]
    BackendClosed { address: String },
    /// The pool is shutting down
    #[error("pool is shutting down")]
    ShuttingDown,
}

impl ForwardError {
    /// Error code reported to the client
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ForwardError::NoBackend(PoolError::Stopped) | ForwardError::ShuttingDown => {
                ProxyErrorCode::ShuttingDown
            }
            ForwardError::NoBackend(_) => ProxyErrorCode::NoBackendAvailable,
            ForwardError::Unhealthy { .. } => ProxyErrorCode::BackendUnhealthy,
            ForwardError::Transport { .. } => ProxyErrorCode::ConnectionFailed,
            ForwardError::Timeout(_) => ProxyErrorCode::RequestTimeout,
            ForwardError::BackendClosed { .. } => ProxyErrorCode::BackendClosed,
            ForwardError::InvalidRequest { .. } => ProxyErrorCode::InternalError,
        }
    }

    /// Whether this is an internal error (as opposed to a timeout or shutdown)
    pub fn is_internal(&self) -> bool {
        self.code().status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No backend could be provisioned or selected
    NoBackendAvailable,
    /// Backend failed its health probe
    BackendUnhealthy,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Backend was torn down mid-exchange
    BackendClosed,
    /// Proxy is shutting down
    ShuttingDown,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::NoBackendAvailable
            | ProxyErrorCode::BackendUnhealthy
            | ProxyErrorCode::ConnectionFailed
            | ProxyErrorCode::BackendClosed
            | ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoBackendAvailable => "NO_BACKEND_AVAILABLE",
            ProxyErrorCode::BackendUnhealthy => "BACKEND_UNHEALTHY",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::BackendClosed => "BACKEND_CLOSED",
            ProxyErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
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
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Synthetic response for a failed forward; details stay in the logs
pub fn forward_error_response(err: &ForwardError) -> Response<BoxBody<Bytes, hyper::Error>> {
    let code = err.code();
    let message = match code {
        ProxyErrorCode::RequestTimeout => "Backend did not respond in time",
        ProxyErrorCode::ShuttingDown => "Proxy is shutting down",
        _ => "Backend server error",
    };
    json_error_response(code, message)
}
