//! Per-request proxy session.
//!
//! A [`ProxySession`] owns the inbound request, the upstream response once it
//! has been fetched, the client's address and a handle to the server context
//! (transport and CONNECT conventions). It is created for every inbound request
//! and consumed by [`ProxySession::finish`].

use super::body::{empty_body, ProxyBody};
use super::connect::{connection_established, handle_connect};
use super::error::{ProxyError, ProxyResult};
use super::transport::Transport;
use http_body_util::BodyExt;
use hyper::header::{self, HeaderMap};
use hyper::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Legacy header some clients send instead of `Connection`.
const PROXY_CONNECTION: &str = "proxy-connection";

/// Server-wide state shared by every session.
#[derive(Debug)]
pub struct ProxyContext {
    transport: Transport,
    proxy_agent: String,
}

impl ProxyContext {
    /// Create a context using `transport` for outbound requests.
    pub fn new(transport: Transport, proxy_agent: impl Into<String>) -> Self {
        Self {
            transport,
            proxy_agent: proxy_agent.into(),
        }
    }

    /// Value of the `Proxy-agent` header sent with CONNECT responses.
    pub fn proxy_agent(&self) -> &str {
        &self.proxy_agent
    }
}

/// A single request's mutable proxy state.
pub struct ProxySession {
    request: Request<ProxyBody>,
    response: Option<Response<ProxyBody>>,
    remote_addr: SocketAddr,
    context: Arc<ProxyContext>,
}

impl ProxySession {
    /// Wrap an inbound request.
    pub fn new(
        request: Request<ProxyBody>,
        remote_addr: SocketAddr,
        context: Arc<ProxyContext>,
    ) -> Self {
        Self {
            request,
            response: None,
            remote_addr,
            context,
        }
    }

    /// The inbound request.
    pub fn request(&self) -> &Request<ProxyBody> {
        &self.request
    }

    /// Mutable access to the inbound request, for handlers that rewrite it.
    pub fn request_mut(&mut self) -> &mut Request<ProxyBody> {
        &mut self.request
    }

    /// The upstream response, once [`get_response`](Self::get_response) has run.
    pub fn response(&self) -> Option<&Response<ProxyBody>> {
        self.response.as_ref()
    }

    /// Address of the client that sent the request.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Shared server context.
    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.context
    }

    /// Split the session into its request, client address and context.
    pub fn into_parts(self) -> (Request<ProxyBody>, SocketAddr, Arc<ProxyContext>) {
        (self.request, self.remote_addr, self.context)
    }

    /// Fetch the upstream response for this session.
    ///
    /// CONNECT sessions get the synthetic "connection established" response.
    /// Other requests have a legacy `Proxy-Connection` header migrated to
    /// `Connection` and are sent through the transport. The request body is
    /// consumed. Calling this again once a response exists does nothing.
    ///
    /// # Errors
    ///
    /// Propagates the transport error when the round trip fails.
    pub async fn get_response(&mut self) -> ProxyResult<()> {
        if self.response.is_some() {
            trace!("Response already present for {}", self.request.uri());
            return Ok(());
        }

        if self.request.method() == Method::CONNECT {
            self.response = Some(connection_established(&self.context.proxy_agent));
            return Ok(());
        }

        migrate_proxy_connection(self.request.headers_mut());

        let mut outbound = Request::new(std::mem::replace(self.request.body_mut(), empty_body()));
        *outbound.method_mut() = self.request.method().clone();
        *outbound.uri_mut() = self.request.uri().clone();
        *outbound.version_mut() = self.request.version();
        *outbound.headers_mut() = self.request.headers().clone();

        debug!("{} {}", outbound.method(), outbound.uri());

        let response = self.context.transport.round_trip(outbound).await?;
        self.response = Some(response.map(|body| body.boxed()));
        Ok(())
    }

    /// Complete the session and produce the client response.
    ///
    /// CONNECT requests open a raw tunnel to the target. Anything else is
    /// answered with the upstream response (fetched now if needed).
    pub async fn finish(mut self) -> ProxyResult<Response<ProxyBody>> {
        if self.request.method() == Method::CONNECT {
            return handle_connect(self).await;
        }

        self.get_response().await?;
        match self.response.take() {
            Some(response) => Ok(relay_response(response)),
            None => Err(ProxyError::InvalidUpstreamResponse(
                "no response was produced".into(),
            )),
        }
    }
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .field("remote_addr", &self.remote_addr)
            .field("has_response", &self.response.is_some())
            .finish()
    }
}

/// Move `Proxy-Connection` into `Connection` unless the latter is already set.
pub(crate) fn migrate_proxy_connection(headers: &mut HeaderMap) {
    if let Some(value) = headers.remove(PROXY_CONNECTION) {
        if !headers.contains_key(header::CONNECTION) {
            headers.insert(header::CONNECTION, value);
        }
    }
}

/// Prepare an upstream response for the client.
///
/// All upstream headers are kept. A `304 Not Modified` has its entity headers
/// dropped so the server side does not frame a body that does not exist.
pub(crate) fn relay_response(response: Response<ProxyBody>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    if parts.status == StatusCode::NOT_MODIFIED {
        parts.headers.remove(header::CONTENT_TYPE);
        parts.headers.remove(header::CONTENT_LENGTH);
        parts.headers.remove(header::TRANSFER_ENCODING);
    }
    Response::from_parts(parts, body)
}
