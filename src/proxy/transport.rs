//! Outbound HTTP/1 transport.
//!
//! Round trips go through pooled hyper-util clients. `https` targets are
//! wrapped in rustls by a `hyper-rustls` connector. With an upstream proxy,
//! plain `http` requests are sent to the proxy in absolute form and `https`
//! requests travel through a CONNECT tunnel opened on the proxy.

use super::body::ProxyBody;
use super::error::ProxyError;
use hyper::body::Incoming;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::{Request, Response, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::{ClientConfig, RootCertStore};
use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tower_service::Service;
use tracing::{debug, warn};

type BoxError = Box<dyn StdError + Send + Sync>;
type DirectClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;
type TunnelClient = Client<HttpsConnector<Tunnel<HttpConnector>>, ProxyBody>;
type ForwardClient = Client<ForwardProxy, ProxyBody>;

/// Performs outbound round trips for proxy sessions.
#[derive(Clone)]
pub struct Transport {
    tls: ClientConfig,
    direct: DirectClient,
    via_http: Option<ForwardClient>,
    via_https: Option<TunnelClient>,
    upstream_proxy: Option<UpstreamProxy>,
    timeout: Option<Duration>,
}

impl Transport {
    /// Transport that trusts the system root certificates.
    ///
    /// An empty system store is logged but not fatal: plain HTTP still works
    /// and HTTPS origins fail their handshake individually.
    pub fn with_native_roots() -> Self {
        let mut root_store = RootCertStore::empty();

        let native_certs = rustls_native_certs::load_native_certs();
        for err in native_certs.errors {
            debug!("Warning loading native cert: {}", err);
        }
        for cert in native_certs.certs {
            if let Err(e) = root_store.add(cert) {
                debug!("Warning adding cert to store: {}", e);
            }
        }

        if root_store.is_empty() {
            warn!("No system root certificates found; HTTPS origins will fail verification");
        } else {
            debug!("Loaded {} root certificates", root_store.len());
        }

        Self::with_roots(root_store)
    }

    /// Transport that trusts exactly `roots`.
    pub fn with_roots(roots: RootCertStore) -> Self {
        let tls = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            direct: client(https_connector(&tls, http_connector())),
            tls,
            via_http: None,
            via_https: None,
            upstream_proxy: None,
            timeout: None,
        }
    }

    /// Route requests through an upstream proxy.
    pub fn with_upstream_proxy(mut self, proxy: Option<UpstreamProxy>) -> Self {
        self.via_http = proxy
            .as_ref()
            .and_then(|p| p.http.clone())
            .map(|proxy_uri| {
                client(ForwardProxy {
                    proxy: proxy_uri,
                    inner: HttpConnector::new(),
                })
            });
        self.via_https = proxy
            .as_ref()
            .and_then(|p| p.https.clone())
            .map(|proxy_uri| {
                client(https_connector(
                    &self.tls,
                    Tunnel::new(proxy_uri, HttpConnector::new()),
                ))
            });
        self.upstream_proxy = proxy;
        self
    }

    /// Bound every round trip by `timeout`. `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The configured upstream proxy, if any.
    pub fn upstream_proxy(&self) -> Option<&UpstreamProxy> {
        self.upstream_proxy.as_ref()
    }

    /// Send `req` to the origin named by its absolute URI and return the
    /// response head with a streaming body.
    ///
    /// Idle origin connections are kept in a pool and reused by later
    /// round trips to the same origin.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::InvalidRequest`] if the URI has no host or an unsupported scheme
    /// - [`ProxyError::UpstreamUnreachable`] if the origin or upstream proxy cannot be dialed,
    ///   or the upstream proxy refuses the tunnel
    /// - [`ProxyError::Tls`] if the origin's TLS handshake fails
    /// - [`ProxyError::InvalidUpstreamResponse`] if the HTTP exchange fails
    /// - [`ProxyError::Timeout`] if a deadline is set and expires
    pub async fn round_trip(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, ProxyError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.send(req))
                .await
                .map_err(|_| ProxyError::Timeout)?,
            None => self.send(req).await,
        }
    }

    async fn send(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, ProxyError> {
        let target = Target::from_uri(req.uri())?;

        let result = match (target.https, &self.via_http, &self.via_https) {
            (false, Some(via), _) => via.request(req).await,
            (true, _, Some(via)) => via.request(req).await,
            _ => self.direct.request(req).await,
        };

        result.map_err(|e| classify(&target.authority, e))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("upstream_proxy", &self.upstream_proxy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn http_connector() -> HttpConnector {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http
}

fn https_connector<C>(tls: &ClientConfig, connector: C) -> HttpsConnector<C> {
    HttpsConnectorBuilder::new()
        .with_tls_config(tls.clone())
        .https_or_http()
        .enable_http1()
        .wrap_connector(connector)
}

fn client<C>(connector: C) -> Client<C, ProxyBody>
where
    C: hyper_util::client::legacy::connect::Connect + Clone,
{
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Map a client failure onto the proxy's error taxonomy.
fn classify(authority: &str, err: hyper_util::client::legacy::Error) -> ProxyError {
    let message = error_chain(&err);
    if !err.is_connect() {
        return ProxyError::InvalidUpstreamResponse(message);
    }
    if is_tls_failure(&err) {
        ProxyError::Tls(format!(
            "Upstream TLS handshake with {} failed: {}",
            authority, message
        ))
    } else {
        ProxyError::UpstreamUnreachable {
            addr: authority.to_string(),
            message,
        }
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn is_tls_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(cause) = current {
        if cause.is::<rustls::Error>() {
            return true;
        }
        let wrapped = cause
            .downcast_ref::<io::Error>()
            .and_then(|io_err| io_err.get_ref())
            .map(|inner| inner.is::<rustls::Error>())
            .unwrap_or(false);
        if wrapped {
            return true;
        }
        current = cause.source();
    }
    false
}

/// Where an absolute request URI points.
struct Target {
    https: bool,
    /// `host:port` with the default port filled in.
    authority: String,
}

impl Target {
    fn from_uri(uri: &Uri) -> Result<Self, ProxyError> {
        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            Some(other) => {
                return Err(ProxyError::InvalidRequest(format!(
                    "Unsupported scheme: {}",
                    other
                )))
            }
            None => {
                return Err(ProxyError::InvalidRequest(
                    "Request URI must be absolute".into(),
                ))
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| ProxyError::InvalidRequest("Missing host in request URI".into()))?;
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        Ok(Self {
            https,
            authority: format!("{}:{}", host, port),
        })
    }
}

/// Connector that dials the upstream proxy for every destination and marks
/// the connection as proxied, so the client writes absolute-form targets.
#[derive(Clone)]
struct ForwardProxy {
    proxy: Uri,
    inner: HttpConnector,
}

impl Service<Uri> for ForwardProxy {
    type Response = Proxied;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Proxied, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        let connecting = self.inner.call(self.proxy.clone());
        Box::pin(async move {
            let stream = connecting.await?;
            Ok(Proxied(stream))
        })
    }
}

/// TCP connection to an upstream proxy.
struct Proxied(TokioIo<TcpStream>);

impl Connection for Proxied {
    fn connected(&self) -> Connected {
        self.0.connected().proxy(true)
    }
}

impl Read for Proxied {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl Write for Proxied {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

/// Upstream proxy addresses for outbound requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamProxy {
    http: Option<Uri>,
    https: Option<Uri>,
}

impl UpstreamProxy {
    /// Proxy addresses given as `host:port` or `http://host:port/`.
    ///
    /// Values that do not parse as a proxy URI are ignored.
    pub fn new(http: Option<&str>, https: Option<&str>) -> Self {
        Self {
            http: http.and_then(proxy_uri),
            https: https.and_then(proxy_uri),
        }
    }

    /// Read `HTTP_PROXY` / `HTTPS_PROXY` (or their lowercase forms).
    ///
    /// Returns `None` when neither is set.
    pub fn from_env() -> Option<Self> {
        let read = |upper: &str, lower: &str| {
            std::env::var(upper)
                .or_else(|_| std::env::var(lower))
                .ok()
        };
        let http = read("HTTP_PROXY", "http_proxy");
        let https = read("HTTPS_PROXY", "https_proxy");
        let proxy = Self::new(http.as_deref(), https.as_deref());

        if proxy.http.is_none() && proxy.https.is_none() {
            None
        } else {
            Some(proxy)
        }
    }

    /// Proxy used for `http` targets.
    pub fn http(&self) -> Option<&Uri> {
        self.http.as_ref()
    }

    /// Proxy used for `https` targets.
    pub fn https(&self) -> Option<&Uri> {
        self.https.as_ref()
    }
}

/// Parse a proxy setting into `http://host:port`, dropping any path.
fn proxy_uri(value: &str) -> Option<Uri> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let uri: Uri = if value.contains("://") {
        value.parse().ok()?
    } else {
        format!("http://{}", value).parse().ok()?
    };
    if uri.scheme_str() != Some("http") {
        debug!("Ignoring upstream proxy with unsupported scheme: {}", value);
        return None;
    }
    let authority = uri.authority()?;
    Uri::builder()
        .scheme("http")
        .authority(authority.clone())
        .path_and_query("/")
        .build()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::body::{empty_body, text_response};
    use http_body_util::BodyExt;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::StatusCode;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn transport() -> Transport {
        Transport::with_roots(RootCertStore::empty())
    }

    /// HTTP server that records request targets and counts connections.
    async fn start_recorder() -> (String, Arc<Mutex<Vec<String>>>, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let targets = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let (seen, count) = (targets.clone(), accepted.clone());
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                count.fetch_add(1, Ordering::SeqCst);
                let seen = seen.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        seen.lock().unwrap().push(req.uri().to_string());
                        async { Ok::<_, Infallible>(text_response(StatusCode::OK, "ok")) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (addr, targets, accepted)
    }

    async fn get(transport: &Transport, url: &str) -> StatusCode {
        let req = Request::get(url).body(empty_body()).unwrap();
        let response = transport.round_trip(req).await.unwrap();
        let status = response.status();
        response.into_body().collect().await.unwrap();
        status
    }

    #[test]
    fn test_upstream_proxy_normalization() {
        let proxy = UpstreamProxy::new(Some("http://10.0.0.1:3128/path"), Some("  "));
        assert_eq!(proxy.http().unwrap(), "http://10.0.0.1:3128/");
        assert_eq!(proxy.https(), None);

        let proxy = UpstreamProxy::new(Some("10.0.0.1:3128"), Some("socks5://10.0.0.1:1080"));
        assert_eq!(proxy.http().unwrap(), "http://10.0.0.1:3128/");
        assert_eq!(proxy.https(), None);
    }

    #[test]
    fn test_target_defaults_ports() {
        let target = Target::from_uri(&"http://example.com/x".parse().unwrap()).unwrap();
        assert!(!target.https);
        assert_eq!(target.authority, "example.com:80");

        let target = Target::from_uri(&"https://[::1]/".parse().unwrap()).unwrap();
        assert!(target.https);
        assert_eq!(target.authority, "[::1]:443");
    }

    #[test]
    fn test_uppercase_scheme_accepted() {
        let target = Target::from_uri(&"HTTPS://example.com/a".parse().unwrap()).unwrap();
        assert!(target.https);
        assert_eq!(target.authority, "example.com:443");
    }

    #[tokio::test]
    async fn test_unsupported_scheme_rejected() {
        let req = Request::builder()
            .uri("ftp://example.com/file")
            .body(empty_body())
            .unwrap();
        let err = transport().round_trip(req).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_missing_host_rejected() {
        let req = Request::builder().uri("/relative").body(empty_body()).unwrap();
        let err = transport().round_trip(req).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_origin_connection_reused() {
        let (addr, targets, accepted) = start_recorder().await;
        let transport = transport();

        assert_eq!(get(&transport, &format!("http://{}/one", addr)).await, StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(get(&transport, &format!("http://{}/two?x=1", addr)).await, StatusCode::OK);

        assert_eq!(*targets.lock().unwrap(), vec!["/one", "/two?x=1"]);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_through_upstream_uses_absolute_form() {
        let (proxy_addr, targets, _) = start_recorder().await;
        let transport =
            transport().with_upstream_proxy(Some(UpstreamProxy::new(Some(&proxy_addr), None)));

        let status = get(&transport, "http://origin.invalid/path?q=1").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            *targets.lock().unwrap(),
            vec!["http://origin.invalid/path?q=1"]
        );
    }

    #[tokio::test]
    async fn test_timeout_on_silent_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold the socket open without answering
        let holder = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let req = Request::builder()
            .uri(format!("http://{}/", addr))
            .body(empty_body())
            .unwrap();
        let err = transport()
            .with_timeout(Some(Duration::from_millis(100)))
            .round_trip(req)
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Timeout));
        holder.abort();
    }

    #[tokio::test]
    async fn test_refused_tunnel_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let transport =
            transport().with_upstream_proxy(Some(UpstreamProxy::new(None, Some(&addr))));
        let req = Request::get("https://example.com/").body(empty_body()).unwrap();
        let err = transport.round_trip(req).await.unwrap_err();

        assert!(matches!(err, ProxyError::UpstreamUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_origin_reported() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let req = Request::get(format!("http://127.0.0.1:{}/", port))
            .body(empty_body())
            .unwrap();

        let err = transport().round_trip(req).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnreachable { .. }));
    }
}
