//! Error types for SSL interception.

use crate::cert::CertError;
use hyper::StatusCode;
use thiserror::Error;

/// Errors from the SSL interceptor.
#[derive(Debug, Error)]
pub enum InterceptError {
    /// The CA identity could not be generated or loaded.
    #[error("Interceptor bootstrap failed: {0}")]
    Bootstrap(#[source] CertError),

    /// The loaded CA certificate cannot sign leaves.
    #[error("Certificate {0} is not a certificate authority")]
    InvalidCa(String),

    /// The CONNECT target could not be parsed.
    #[error("Invalid interception target: {0}")]
    InvalidTarget(String),

    /// The leaf certificate for a host could not be generated or loaded.
    #[error("Failed to obtain certificate for '{host}': {source}")]
    HostKeyPair {
        /// Host the certificate was requested for.
        host: String,
        /// The underlying certificate error.
        #[source]
        source: CertError,
    },

    /// TLS configuration for the local listener failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Local listener or loopback connection failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InterceptError {
    /// HTTP status the client should receive when interception fails.
    pub fn status_code(&self) -> StatusCode {
        match self {
            InterceptError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            InterceptError::HostKeyPair { .. } | InterceptError::Tls(_) | InterceptError::Io(_) => {
                StatusCode::BAD_GATEWAY
            }
            InterceptError::Bootstrap(_) | InterceptError::InvalidCa(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            InterceptError::InvalidTarget("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            InterceptError::Tls("bad".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        let err = InterceptError::HostKeyPair {
            host: "example.com".into(),
            source: CertError::KeyGeneration("no entropy".into()),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(err.to_string().contains("example.com"));
    }
}
