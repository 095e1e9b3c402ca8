//! Forward proxy server.
//!
//! This module provides the listener that:
//! - Accepts client connections on TCP (optionally TLS-wrapped)
//! - Serves HTTP/1.1 with upgrade support so CONNECT can hand over the socket
//! - Wraps each request in a [`ProxySession`] and dispatches it to the
//!   configured [`ProxyHandler`]
//!
//! # Example
//!
//! ```ignore
//! use waypost::proxy::{Passthrough, ProxyConfig, ProxyServer};
//! use std::sync::Arc;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServer::new(ProxyConfig::default(), Arc::new(Passthrough), shutdown_rx);
//! server.run().await?;
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! ```

use super::body::ProxyBody;
use super::error::ProxyError;
use super::handler::ProxyHandler;
use super::loopcheck::check_proxy_loop;
use super::session::{ProxyContext, ProxySession};
use super::transport::{Transport, UpstreamProxy};
use crate::cert::get_or_generate_key_pair;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// `Proxy-agent` sent with CONNECT responses unless configured otherwise.
pub const DEFAULT_PROXY_AGENT: &str = concat!("Waypost/", env!("CARGO_PKG_VERSION"));

/// Common name of the generated certificate for a TLS listener.
pub const LISTENER_COMMON_NAME: &str = "proxy.waypost.local";

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// `Proxy-agent` header value for CONNECT responses.
    pub proxy_agent: String,
    /// Forward through `HTTP_PROXY` / `HTTPS_PROXY` when set.
    pub use_env_proxy: bool,
    /// External URL used to detect whether the upstream proxy is ourselves.
    ///
    /// The check only runs when an upstream proxy is in use.
    pub loop_test_url: Option<String>,
    /// Deadline for each outbound round trip. `None` waits indefinitely.
    pub upstream_timeout: Option<Duration>,
    /// Certificate for serving the listener over TLS.
    pub tls_cert: Option<PathBuf>,
    /// Private key for serving the listener over TLS.
    pub tls_key: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            proxy_agent: DEFAULT_PROXY_AGENT.to_string(),
            use_env_proxy: false,
            loop_test_url: None,
            upstream_timeout: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// The main proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    handler: Arc<dyn ProxyHandler>,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
    /// Outbound transport override.
    transport: Option<Transport>,
}

impl ProxyServer {
    /// Create a new proxy server dispatching every session to `handler`.
    pub fn new(
        config: ProxyConfig,
        handler: Arc<dyn ProxyHandler>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            handler,
            shutdown_rx,
            transport: None,
        }
    }

    /// Use `transport` for outbound requests instead of building one from
    /// the configuration.
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Run the proxy server.
    ///
    /// Runs the loop check (if configured), binds the listener and accepts
    /// connections until the shutdown signal is received.
    pub async fn run(mut self) -> Result<(), ProxyError> {
        let transport = match self.transport.take() {
            Some(transport) => transport,
            None => build_transport(&self.config, true).await,
        };

        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        info!("Proxy listening on {}", listener.local_addr()?);

        self.accept_loop(listener, transport).await
    }

    /// Accept connections on an already bound listener.
    ///
    /// The loop check is skipped since the port is already taken.
    pub async fn serve(mut self, listener: TcpListener) -> Result<(), ProxyError> {
        let transport = match self.transport.take() {
            Some(transport) => transport,
            None => build_transport(&self.config, false).await,
        };
        self.accept_loop(listener, transport).await
    }

    async fn accept_loop(self, listener: TcpListener, transport: Transport) -> Result<(), ProxyError> {
        let context = Arc::new(ProxyContext::new(transport, self.config.proxy_agent.clone()));
        let tls = self.tls_acceptor()?;

        // Accept loop
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, remote_addr)) => {
                            debug!("Accepted connection from {}", remote_addr);
                            self.spawn_connection_handler(stream, remote_addr, tls.clone(), context.clone());
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// TLS acceptor for the listener, when a certificate is configured.
    fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ProxyError> {
        let (Some(cert_path), Some(key_path)) = (&self.config.tls_cert, &self.config.tls_key) else {
            return Ok(None);
        };

        let identity = get_or_generate_key_pair(
            cert_path,
            key_path,
            LISTENER_COMMON_NAME,
            "Waypost",
            false,
            None,
        )?;

        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(identity.chain().to_vec(), identity.private_key_der())?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        info!("Serving proxy listener over TLS with {:?}", cert_path);
        Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
    }

    /// Spawn a task to handle a single connection.
    fn spawn_connection_handler(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        context: Arc<ProxyContext>,
    ) {
        let handler = self.handler.clone();

        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        handle_connection(tls_stream, remote_addr, handler, context).await
                    }
                    Err(e) => Err(ProxyError::Tls(format!(
                        "Client TLS handshake failed: {}",
                        e
                    ))),
                },
                None => handle_connection(stream, remote_addr, handler, context).await,
            };

            if let Err(e) = result {
                if is_disconnect(&e) {
                    debug!("Connection from {} ended: {}", remote_addr, e);
                } else {
                    warn!("Connection error from {}: {}", remote_addr, e);
                }
            }
        });
    }
}

/// Outbound transport for `config`.
///
/// When an environment proxy is configured and `check_loop` is set, the loop
/// check decides whether it may be used. A probe that cannot bind is logged
/// and treated as "no loop".
async fn build_transport(config: &ProxyConfig, check_loop: bool) -> Transport {
    let direct = Transport::with_native_roots().with_timeout(config.upstream_timeout);
    if !config.use_env_proxy {
        return direct;
    }
    let Some(upstream) = UpstreamProxy::from_env() else {
        return direct;
    };

    let proxied = direct.clone().with_upstream_proxy(Some(upstream));
    if let (true, Some(url)) = (check_loop, config.loop_test_url.as_deref()) {
        match check_proxy_loop(config.port, url, &proxied).await {
            Ok(true) => {
                warn!("Upstream proxy routes back to this proxy; connecting directly");
                return direct;
            }
            Ok(false) => debug!("No proxy loop detected"),
            Err(e) => warn!("Proxy loop check failed, assuming no loop: {}", e),
        }
    }

    info!("Forwarding through upstream proxy {:?}", proxied.upstream_proxy());
    proxied
}

/// Serve HTTP/1.1 on one client connection.
async fn handle_connection<I>(
    io: I,
    remote_addr: SocketAddr,
    handler: Arc<dyn ProxyHandler>,
    context: Arc<ProxyContext>,
) -> Result<(), ProxyError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        let context = context.clone();
        async move { Ok::<_, Infallible>(serve_inbound(req, remote_addr, handler, context).await) }
    });

    // Serve HTTP/1.1 with support for upgrades (needed for CONNECT).
    // The CONNECT reply carries only the status line and Proxy-Agent.
    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .auto_date_header(false)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

/// Dispatch one inbound request to `handler`.
///
/// The request is wrapped in a fresh session bound to `context`.
pub async fn serve_inbound(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    handler: Arc<dyn ProxyHandler>,
    context: Arc<ProxyContext>,
) -> Response<ProxyBody> {
    let req = req.map(|body| body.boxed());

    debug!("{} {} from {}", req.method(), req.uri(), remote_addr);
    handler
        .handle_proxy(ProxySession::new(req, remote_addr, context))
        .await
}

/// Whether an error is just the peer going away.
fn is_disconnect(err: &ProxyError) -> bool {
    match err {
        ProxyError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
        ),
        ProxyError::Http(e) => e.is_incomplete_message() || e.is_canceled(),
        other => {
            let message = other.to_string().to_ascii_lowercase();
            message.contains("connection reset") || message.contains("broken pipe")
        }
    }
}
