//! Pluggable proxy handler contract.
//!
//! A [`ProxyHandler`] is invoked once per inbound session. Load balancing,
//! moderation and interception are all handlers, and they compose by wrapping
//! an inner `Arc<dyn ProxyHandler>`.

use super::body::ProxyBody;
use super::session::ProxySession;
use async_trait::async_trait;
use hyper::Response;
use tracing::warn;

/// Handles one proxied request/response cycle (or tunnel).
#[async_trait]
pub trait ProxyHandler: Send + Sync {
    /// Complete the session and produce the response for the client.
    async fn handle_proxy(&self, session: ProxySession) -> Response<ProxyBody>;
}

/// Forwards every request unchanged to its own target.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

#[async_trait]
impl ProxyHandler for Passthrough {
    async fn handle_proxy(&self, session: ProxySession) -> Response<ProxyBody> {
        let target = session.request().uri().to_string();
        match session.finish().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Proxying {} failed: {}", target, e);
                e.into_response()
            }
        }
    }
}
