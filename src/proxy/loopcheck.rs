//! Proxy loop detection.
//!
//! When the proxy is told to use an upstream proxy from the environment, that
//! upstream may well be this very process. The check binds a throwaway probe
//! server on the port the proxy is about to use, sends an external request
//! carrying a random token through the outbound transport, and reports a loop
//! if the probe sees its own token.

use super::body::{empty_body, text_response};
use super::error::ProxyError;
use super::transport::Transport;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use rand::RngCore;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Query parameter carrying the probe token.
pub const PROBE_PARAM: &str = "waypostLoopProbe";

const TOKEN_BYTES: usize = 16;

/// Check whether requests sent through `transport` come back to `port`.
///
/// Returns `Ok(true)` if the probe received its own request. A failed
/// external request is not an error; it simply proves nothing looped.
///
/// # Errors
///
/// Returns [`ProxyError::LoopCheckBind`] if the probe cannot listen on
/// `127.0.0.1:port`.
pub async fn check_proxy_loop(
    port: u16,
    test_url: &str,
    transport: &Transport,
) -> Result<bool, ProxyError> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|source| ProxyError::LoopCheckBind { port, source })?;

    let token = random_token();
    let seen = Arc::new(AtomicBool::new(false));

    let probe = {
        let token = token.clone();
        let seen = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let token = token.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let hit = req
                            .uri()
                            .query()
                            .map(|q| q.contains(token.as_str()))
                            .unwrap_or(false);
                        if hit {
                            seen.store(true, Ordering::SeqCst);
                        }
                        async move {
                            Ok::<_, Infallible>(text_response(StatusCode::OK, "probe"))
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        })
    };

    let url = probe_url(test_url, &token);
    debug!("Checking for proxy loop via {}", url);

    match Request::get(url.as_str()).body(empty_body()) {
        Ok(req) => {
            if let Err(e) = transport.round_trip(req).await {
                debug!("Loop probe request failed: {}", e);
            }
        }
        Err(e) => debug!("Loop probe URL is invalid: {}", e),
    }

    probe.abort();

    let looped = seen.load(Ordering::SeqCst);
    if looped {
        info!("Proxy loop detected on port {}", port);
    }
    Ok(looped)
}

/// Append the probe token to `url` as a query parameter.
fn probe_url(url: &str, token: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}", url, separator, PROBE_PARAM, token)
}

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
