//! HTTP CONNECT tunneling.
//!
//! The flow for a plain (non-intercepted) tunnel is:
//!
//! 1. Client sends: `CONNECT api.example.com:443 HTTP/1.1`
//! 2. Proxy dials the target; on failure the client gets `503`
//! 3. Proxy answers `200 Connection established` and hyper hands over the
//!    raw connection
//! 4. Bytes are duplexed between client and target until both sides close

use super::body::{empty_body, ProxyBody};
use super::error::ProxyError;
use super::session::ProxySession;
use hyper::ext::ReasonPhrase;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinError;
use tracing::{debug, warn};

/// Port used when a CONNECT target omits one.
pub const DEFAULT_CONNECT_PORT: u16 = 443;

/// Build the `200 Connection established` response sent before tunneling.
pub fn connection_established(proxy_agent: &str) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection established"));
    if let Ok(value) = proxy_agent.parse() {
        response.headers_mut().insert("proxy-agent", value);
    }
    response
}

/// Dial the CONNECT target and tunnel the client connection to it.
///
/// The target is dialed before answering so an unreachable host is reported
/// to the client instead of producing a tunnel that immediately closes.
pub(crate) async fn handle_connect(session: ProxySession) -> Result<Response<ProxyBody>, ProxyError> {
    let (mut req, remote_addr, context) = session.into_parts();
    let (host, port) = connect_target(&req)?;

    debug!("CONNECT {}:{} from {}", host, port, remote_addr);

    let upstream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| ProxyError::UpstreamUnreachable {
            addr: format!("{}:{}", host, port),
            message: e.to_string(),
        })?;

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => match tunnel(TokioIo::new(upgraded), upstream).await {
                Ok((sent, received)) => {
                    debug!(
                        "Tunnel to {}:{} closed ({} bytes out, {} bytes in)",
                        host, port, sent, received
                    );
                }
                Err(e) => debug!("Tunnel to {}:{} ended: {}", host, port, e),
            },
            Err(e) => warn!("HTTP upgrade failed for {}:{}: {}", host, port, e),
        }
    });

    Ok(connection_established(context.proxy_agent()))
}

/// Extract `(host, port)` from a CONNECT request's authority.
pub(crate) fn connect_target<B>(req: &Request<B>) -> Result<(String, u16), ProxyError> {
    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidConnect("Missing authority in CONNECT request".into()))?;
    parse_host_port(authority.as_str())
}

/// Duplex bytes between `a` and `b` until both directions finish.
///
/// Each direction runs as its own task and shuts down its destination once
/// its source reaches end-of-stream, so a half-close travels through the
/// tunnel. If either direction fails the other is aborted and both streams
/// are dropped. Returns the byte counts copied `a -> b` and `b -> a`.
pub async fn tunnel<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let mut a_to_b = tokio::spawn(copy_half(a_read, b_write));
    let mut b_to_a = tokio::spawn(copy_half(b_read, a_write));

    tokio::select! {
        first = &mut a_to_b => match joined(first) {
            Ok(sent) => Ok((sent, joined(b_to_a.await)?)),
            Err(e) => {
                b_to_a.abort();
                Err(e)
            }
        },
        first = &mut b_to_a => match joined(first) {
            Ok(received) => Ok((joined(a_to_b.await)?, received)),
            Err(e) => {
                a_to_b.abort();
                Err(e)
            }
        },
    }
}

async fn copy_half<R, W>(mut reader: ReadHalf<R>, mut writer: WriteHalf<W>) -> io::Result<u64>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}

fn joined(result: Result<io::Result<u64>, JoinError>) -> io::Result<u64> {
    result.map_err(io::Error::other)?
}

/// Parse host:port string from a CONNECT authority.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", 443) (default port)
/// - `[::1]:8443` -> ("::1", 8443)
pub(crate) fn parse_host_port(authority: &str) -> Result<(String, u16), ProxyError> {
    if authority.starts_with('[') && authority.ends_with(']') {
        return Ok((
            authority[1..authority.len() - 1].to_string(),
            DEFAULT_CONNECT_PORT,
        ));
    }

    if let Some((host, port_str)) = authority.rsplit_once(':') {
        let port = port_str.parse::<u16>().map_err(|_| {
            ProxyError::InvalidConnect(format!("Invalid port: {}", port_str))
        })?;

        // IPv6 literal like [::1]:443
        if host.starts_with('[') && host.ends_with(']') {
            return Ok((host[1..host.len() - 1].to_string(), port));
        }
        if host.is_empty() {
            return Err(ProxyError::InvalidConnect("Missing host".into()));
        }
        Ok((host.to_string(), port))
    } else if authority.is_empty() {
        Err(ProxyError::InvalidConnect("Missing host".into()))
    } else {
        Ok((authority.to_string(), DEFAULT_CONNECT_PORT))
    }
}
