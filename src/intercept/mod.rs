//! SSL interception.
//!
//! CONNECT tunnels are terminated locally with per-host leaf certificates
//! signed by a persistent CA, and the decrypted requests are handed to an
//! [`InterceptHandler`]. Clients must trust the CA certificate
//! (`waypost ca` prints it).

pub mod cache;
pub mod error;
pub mod interceptor;

pub use cache::HostCertCache;
pub use error::InterceptError;
pub use interceptor::{
    ForwardIntercepted, InterceptConnect, InterceptHandler, InterceptState, InterceptorConfig,
    SslInterceptor, CA_COMMON_NAME,
};
