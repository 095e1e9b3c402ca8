//! PEM and DER helpers for persisted key material.
//!
//! Keys are written as PKCS#1 `RSA PRIVATE KEY` blocks. rcgen and rustls work
//! with PKCS#8, so the private key is unwrapped from (and re-wrapped into) the
//! PKCS#8 `PrivateKeyInfo` envelope at the file boundary.

use super::error::CertError;
use pem::{EncodeConfig, LineEnding, Pem};
use pkcs1::RsaPrivateKey;
use pkcs8::der::Encode;
use pkcs8::PrivateKeyInfo;

/// PEM label for X.509 certificates.
pub const CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// PEM label for PKCS#1 RSA private keys.
pub const RSA_PRIVATE_KEY_LABEL: &str = "RSA PRIVATE KEY";

/// PEM label for PKCS#8 private keys.
pub const PRIVATE_KEY_LABEL: &str = "PRIVATE KEY";

/// Encode DER bytes as a PEM block with the given label and `\n` line endings.
pub fn encode(label: &str, der: &[u8]) -> String {
    pem::encode_config(
        &Pem::new(label, der),
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    )
}

/// Extract the PKCS#1 `RSAPrivateKey` from a PKCS#8 `PrivateKeyInfo`.
pub fn pkcs8_to_pkcs1(pkcs8: &[u8]) -> Result<Vec<u8>, CertError> {
    let info = PrivateKeyInfo::try_from(pkcs8).map_err(malformed)?;
    if info.algorithm.oid != pkcs1::ALGORITHM_OID {
        return Err(CertError::MalformedKey("private key is not an RSA key".into()));
    }
    RsaPrivateKey::try_from(info.private_key).map_err(malformed)?;
    Ok(info.private_key.to_vec())
}

/// Wrap a PKCS#1 `RSAPrivateKey` in a PKCS#8 `PrivateKeyInfo`.
pub fn pkcs1_to_pkcs8(pkcs1: &[u8]) -> Result<Vec<u8>, CertError> {
    RsaPrivateKey::try_from(pkcs1).map_err(malformed)?;
    PrivateKeyInfo::new(pkcs1::ALGORITHM_ID, pkcs1)
        .to_der()
        .map_err(malformed)
}

fn malformed(err: impl std::fmt::Display) -> CertError {
    CertError::MalformedKey(err.to_string())
}
