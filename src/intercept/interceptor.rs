//! SSL interception of CONNECT tunnels.
//!
//! Instead of relaying a CONNECT tunnel's bytes to the origin, the interceptor
//! terminates the client's TLS locally with a forged leaf certificate:
//!
//! 1. Resolve the target host and fetch its leaf from the [`HostCertCache`]
//! 2. Bind a TLS listener on an ephemeral loopback port presenting leaf + CA
//! 3. Connect a plain loopback socket to that listener
//! 4. Answer `200 Connection established` and duplex the hijacked client
//!    connection with the loopback socket
//! 5. The listener accepts exactly one connection, completes the forged
//!    handshake and serves the decrypted HTTP/1.1 requests to an
//!    [`InterceptHandler`]
//!
//! The served chain holds only the forged leaf and the CA certificate. It does
//! not mirror the origin's real certificate (issuer chain, validity window,
//! SAN set), so clients that pin certificates will refuse the connection.

use super::cache::HostCertCache;
use super::error::InterceptError;
use crate::cert::{get_or_generate_key_pair, CertError, KeyPair};
use crate::proxy::connect::connect_target;
use crate::proxy::{
    connection_established, text_response, tunnel, ProxyBody, ProxyContext, ProxyHandler,
    ProxySession,
};
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Common name of the generated interception CA.
pub const CA_COMMON_NAME: &str = "interceptor.waypost.local";

/// Organization of the generated interception CA.
pub const CA_ORGANIZATION: &str = "Waypost";

/// Where the interceptor keeps its CA and leaf certificates.
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    /// CA certificate PEM path.
    pub ca_cert: PathBuf,
    /// CA private key PEM path.
    pub ca_key: PathBuf,
    /// Directory for per-host leaf certificates.
    pub host_cert_dir: PathBuf,
}

/// Handles requests decrypted by the interceptor.
#[async_trait]
pub trait InterceptHandler: Send + Sync {
    /// Produce the response for a decrypted request.
    ///
    /// `session` carries the decrypted request, rewritten to an absolute
    /// `https` URI for the CONNECT target. `original` is the CONNECT request
    /// that opened the tunnel.
    async fn handle_intercept(
        &self,
        session: ProxySession,
        original: Arc<Request<()>>,
    ) -> Response<ProxyBody>;
}

/// Lifecycle of one intercepted CONNECT, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptState {
    /// The client connection has been taken over.
    Hijacked,
    /// The forged TLS listener is bound.
    LocalTlsListening,
    /// Bytes are flowing between client and listener.
    Tunneling,
    /// Both directions have finished.
    Closed,
}

impl fmt::Display for InterceptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterceptState::Hijacked => "hijacked",
            InterceptState::LocalTlsListening => "local-tls-listening",
            InterceptState::Tunneling => "tunneling",
            InterceptState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Terminates CONNECT tunnels with forged certificates.
pub struct SslInterceptor {
    ca: Arc<KeyPair>,
    cache: HostCertCache,
    handler: Arc<dyn InterceptHandler>,
}

impl SslInterceptor {
    /// Load (or create) the CA and set up the leaf cache.
    ///
    /// # Errors
    ///
    /// - [`InterceptError::Bootstrap`] if the CA cannot be generated or loaded,
    ///   or the leaf directory cannot be created
    /// - [`InterceptError::InvalidCa`] if the loaded certificate is not a CA
    pub fn new(
        config: &InterceptorConfig,
        handler: Arc<dyn InterceptHandler>,
    ) -> Result<Self, InterceptError> {
        std::fs::create_dir_all(&config.host_cert_dir)
            .map_err(|e| InterceptError::Bootstrap(CertError::io(&config.host_cert_dir, e)))?;

        let ca = get_or_generate_key_pair(
            &config.ca_cert,
            &config.ca_key,
            CA_COMMON_NAME,
            CA_ORGANIZATION,
            true,
            None,
        )
        .map_err(InterceptError::Bootstrap)?;

        ensure_ca(&ca, &config.ca_cert)?;
        info!("Interception CA loaded from {:?}", config.ca_cert);

        let ca = Arc::new(ca);
        Ok(Self {
            cache: HostCertCache::new(ca.clone(), config.host_cert_dir.clone()),
            ca,
            handler,
        })
    }

    /// The CA key pair.
    pub fn ca(&self) -> &KeyPair {
        &self.ca
    }

    /// The leaf certificate cache.
    pub fn cache(&self) -> &HostCertCache {
        &self.cache
    }

    /// Leaf key pair for `common_name`, generated at most once per process.
    pub async fn get_host_key_pair(&self, common_name: &str) -> Result<Arc<KeyPair>, InterceptError> {
        self.cache.get(common_name).await
    }

    /// Warm the cache for `hosts` in the background.
    pub fn preload(self: &Arc<Self>, hosts: Vec<String>) -> JoinHandle<()> {
        let interceptor = self.clone();
        tokio::spawn(async move {
            for host in hosts {
                match interceptor.get_host_key_pair(&host).await {
                    Ok(_) => debug!("Preloaded certificate for {}", host),
                    Err(e) => warn!("Failed to preload certificate for {}: {}", host, e),
                }
            }
        })
    }

    /// Take over a CONNECT session and serve its decrypted traffic.
    ///
    /// Returns the `200 Connection established` response. Decryption and
    /// relaying continue in background tasks once hyper hands over the
    /// connection.
    pub async fn intercept(&self, session: ProxySession) -> Result<Response<ProxyBody>, InterceptError> {
        let (mut req, remote_addr, context) = session.into_parts();
        let (host, _port) =
            connect_target(&req).map_err(|e| InterceptError::InvalidTarget(e.to_string()))?;
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| host.clone());
        debug!(state = %InterceptState::Hijacked, "Taking over CONNECT to {} from {}", authority, remote_addr);

        let leaf = self.get_host_key_pair(&host).await?;
        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(leaf.chain_with(&self.ca), leaf.private_key_der())
            .map_err(|e| InterceptError::Tls(e.to_string()))?;
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        debug!(state = %InterceptState::LocalTlsListening, "Intercepting {} on {}", authority, local_addr);
        let loopback = TcpStream::connect(local_addr).await?;

        let original = Arc::new(request_head(&req));
        let on_upgrade = hyper::upgrade::on(&mut req);

        tokio::spawn(serve_decrypted(
            listener,
            acceptor,
            DecryptedTarget {
                authority: authority.clone(),
                remote_addr,
                original,
            },
            context.clone(),
            self.handler.clone(),
        ));

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    debug!(state = %InterceptState::Tunneling, "Relaying {} from {} through {}", authority, remote_addr, local_addr);
                    match tunnel(TokioIo::new(upgraded), loopback).await {
                        Ok((sent, received)) => debug!(
                            state = %InterceptState::Closed,
                            "Interception of {} finished ({} bytes out, {} bytes in)",
                            authority, sent, received
                        ),
                        Err(e) => debug!(state = %InterceptState::Closed, "Interception of {} ended: {}", authority, e),
                    }
                }
                Err(e) => warn!("HTTP upgrade failed for {}: {}", authority, e),
            }
        });

        Ok(connection_established(context.proxy_agent()))
    }
}

impl fmt::Debug for SslInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslInterceptor")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

fn ensure_ca(ca: &KeyPair, path: &std::path::Path) -> Result<(), InterceptError> {
    let (_, cert) = X509Certificate::from_der(ca.certificate_der().as_ref())
        .map_err(|e| InterceptError::Bootstrap(CertError::CertificateCreation(e.to_string())))?;
    let is_ca = cert
        .basic_constraints()
        .ok()
        .flatten()
        .map(|bc| bc.value.ca)
        .unwrap_or(false);
    if is_ca {
        Ok(())
    } else {
        Err(InterceptError::InvalidCa(path.display().to_string()))
    }
}

/// Copy of a request's head without its body.
fn request_head<B>(req: &Request<B>) -> Request<()> {
    let mut head = Request::new(());
    *head.method_mut() = req.method().clone();
    *head.uri_mut() = req.uri().clone();
    *head.version_mut() = req.version();
    *head.headers_mut() = req.headers().clone();
    head
}

struct DecryptedTarget {
    authority: String,
    remote_addr: SocketAddr,
    original: Arc<Request<()>>,
}

/// Accept the single loopback connection and serve its decrypted requests.
async fn serve_decrypted(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    target: DecryptedTarget,
    context: Arc<ProxyContext>,
    handler: Arc<dyn InterceptHandler>,
) {
    let stream = match listener.accept().await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!("Local TLS listener for {} failed: {}", target.authority, e);
            return;
        }
    };
    drop(listener);

    let tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(e) => {
            debug!("Client rejected forged certificate for {}: {}", target.authority, e);
            return;
        }
    };

    let target = Arc::new(target);
    let authority = target.authority.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let target = target.clone();
        let context = context.clone();
        let handler = handler.clone();
        async move {
            let response = match decrypted_request(req, &target.authority) {
                Ok(req) => {
                    let session = ProxySession::new(req, target.remote_addr, context);
                    handler.handle_intercept(session, target.original.clone()).await
                }
                Err(e) => text_response(hyper::StatusCode::BAD_REQUEST, e),
            };
            Ok::<_, Infallible>(response)
        }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(tls), service)
        .await
    {
        debug!("Decrypted connection for {} ended: {}", authority, e);
    }
}

/// Rewrite a decrypted request to an absolute `https` URI for `authority`.
fn decrypted_request(req: Request<Incoming>, authority: &str) -> Result<Request<ProxyBody>, String> {
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .to_string();
    let uri = Uri::builder()
        .scheme("https")
        .authority(authority)
        .path_and_query(path)
        .build()
        .map_err(|e| e.to_string())?;

    let mut req = req.map(|body| body.boxed());
    *req.uri_mut() = uri;
    Ok(req)
}

/// Passes decrypted requests on to a [`ProxyHandler`].
pub struct ForwardIntercepted {
    inner: Arc<dyn ProxyHandler>,
}

impl ForwardIntercepted {
    /// Forward decrypted requests to `inner`.
    pub fn new(inner: Arc<dyn ProxyHandler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl InterceptHandler for ForwardIntercepted {
    async fn handle_intercept(
        &self,
        session: ProxySession,
        original: Arc<Request<()>>,
    ) -> Response<ProxyBody> {
        debug!(
            "Decrypted {} {} (tunnel {})",
            session.request().method(),
            session.request().uri(),
            original.uri()
        );
        self.inner.handle_proxy(session).await
    }
}

/// Sends CONNECT sessions to the interceptor and everything else to `inner`.
pub struct InterceptConnect {
    interceptor: Arc<SslInterceptor>,
    inner: Arc<dyn ProxyHandler>,
}

impl InterceptConnect {
    /// Route CONNECT to `interceptor`, other methods to `inner`.
    pub fn new(interceptor: Arc<SslInterceptor>, inner: Arc<dyn ProxyHandler>) -> Self {
        Self { interceptor, inner }
    }
}

#[async_trait]
impl ProxyHandler for InterceptConnect {
    async fn handle_proxy(&self, session: ProxySession) -> Response<ProxyBody> {
        if session.request().method() != Method::CONNECT {
            return self.inner.handle_proxy(session).await;
        }

        let target = session.request().uri().to_string();
        match self.interceptor.intercept(session).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Interception of {} failed: {}", target, e);
                text_response(e.status_code(), e.to_string())
            }
        }
    }
}
