//! Certificate authority primitives.
//!
//! Generates RSA key pairs with self-signed or CA-signed X.509 certificates,
//! persists them as PEM (`CERTIFICATE` and `RSA PRIVATE KEY`) and reloads them
//! from disk. The interceptor uses this to keep a stable CA and stable per-host
//! leaves across restarts.

mod authority;
pub mod encoding;
mod error;

pub use authority::{
    generate_key_pair, get_or_generate_key_pair, load_key_pair, serial_number, KeyPair,
    RSA_KEY_BITS, SERIAL_BYTES,
};
pub use error::CertError;
