//! Error types for proxy operations.
//!
//! This module defines structured error types for the forward proxy:
//! - Server errors (binding, accept, loop detection)
//! - Connection errors (upstream dial, TLS, round trip)
//! - Routing errors (load balancer lookups)
//!
//! Every error knows the HTTP status a client should see, so handlers can
//! answer a failed session without crashing the connection.

use super::balancer::BalancerError;
use super::body::{text_response, ProxyBody};
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Body text for sessions whose upstream could not be reached.
pub const UNAVAILABLE_MESSAGE: &str = "This page is temporarily unavailable";

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Invalid CONNECT request.
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// Request cannot be forwarded as given.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// TLS error during handshake or configuration.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Upstream did not answer within the configured deadline.
    #[error("Upstream timeout")]
    Timeout,

    /// Failed to dial the upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamUnreachable {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// The outbound round trip failed after the connection was established.
    #[error("Invalid upstream response: {0}")]
    InvalidUpstreamResponse(String),

    /// The loop-detection probe could not bind its listener.
    #[error("Failed to bind loop probe on port {port}: {source}")]
    LoopCheckBind {
        /// Port the probe tried to listen on.
        port: u16,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Load balancer could not route the request.
    #[error(transparent)]
    Route(#[from] BalancerError),

    /// Proxy listener identity could not be loaded.
    #[error("Listener certificate error: {0}")]
    Certificate(#[from] crate::cert::CertError),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// HTTP status a client should receive for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidConnect(_) | ProxyError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::UpstreamUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Route(err) => err.status_code(),
            ProxyError::Http(_)
            | ProxyError::Tls(_)
            | ProxyError::InvalidUpstreamResponse(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render this error as a plain-text response.
    pub fn into_response(self) -> Response<ProxyBody> {
        let status = self.status_code();
        let message = match status {
            StatusCode::SERVICE_UNAVAILABLE => UNAVAILABLE_MESSAGE.to_string(),
            StatusCode::NOT_FOUND => "Not found".to_string(),
            _ => self.to_string(),
        };
        text_response(status, message)
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_display() {
        let err = ProxyError::InvalidConnect("missing authority".to_string());
        assert!(err.to_string().contains("missing authority"));
    }

    #[test]
    fn test_upstream_unreachable_error() {
        let err = ProxyError::UpstreamUnreachable {
            addr: "api.example.com:443".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("api.example.com:443"));
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ProxyError::InvalidUpstreamResponse("reset".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::InvalidRequest("no host".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ProxyError::Route(BalancerError::RouteNotFound("x.test".into())).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_unavailable_response() {
        let err = ProxyError::UpstreamUnreachable {
            addr: "down.test:80".to_string(),
            message: "refused".to_string(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Io(_)));
    }
}
