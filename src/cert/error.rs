//! Error types for certificate authority operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from key pair generation, persistence and loading.
#[derive(Debug, Error)]
pub enum CertError {
    /// The operating system entropy source could not be read.
    #[error("Failed to read random bytes: {0}")]
    Randomness(String),

    /// Failed to generate an RSA key.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to build or sign a certificate.
    #[error("Failed to create certificate: {0}")]
    CertificateCreation(String),

    /// Failed to read or write a certificate or key file.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File that could not be accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A PEM file did not contain the expected block.
    #[error("No {label} block found in {path}")]
    MissingPem {
        /// File that was parsed.
        path: PathBuf,
        /// The PEM label that was expected.
        label: &'static str,
    },

    /// A private key could not be decoded.
    #[error("Malformed private key: {0}")]
    MalformedKey(String),
}

impl CertError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CertError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_names_path() {
        let err = CertError::io(
            "/var/lib/waypost/ca_key.pem",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/var/lib/waypost/ca_key.pem"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_missing_pem_display() {
        let err = CertError::MissingPem {
            path: PathBuf::from("site_cert.pem"),
            label: "CERTIFICATE",
        };
        assert_eq!(err.to_string(), "No CERTIFICATE block found in site_cert.pem");
    }
}
