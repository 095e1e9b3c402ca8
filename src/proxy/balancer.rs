//! Load balancing across backend hosts.
//!
//! A route maps a logical host (the inbound `Host` header) to an ordered list
//! of backend `host:port` addresses. The [`Strategy`] decides which backend
//! serves each request:
//!
//! - `First`: always the first backend
//! - `Random`: uniform random pick
//! - `RoundRobin`: configured order, repeated; each route owns a rotation task
//!   feeding a small bounded channel
//! - `Fair`: reserved; selecting it fails every lookup
//!
//! [`LoadBalancer`] is also a [`ProxyHandler`]: it rewrites the request to the
//! chosen backend, appends `X-Forwarded-For` and completes the session.

use super::body::ProxyBody;
use super::error::ProxyError;
use super::handler::ProxyHandler;
use super::session::ProxySession;
use async_trait::async_trait;
use hyper::header::{HeaderValue, HOST};
use hyper::{Response, StatusCode, Uri};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

/// Capacity of each round-robin rotation buffer.
pub const ROTATION_BUFFER: usize = 2;

/// Header listing the client addresses a request was forwarded for.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Backend selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Always use the first backend.
    #[default]
    First,
    /// Pick a backend uniformly at random.
    Random,
    /// Cycle through backends in configured order.
    RoundRobin,
    /// Reserved.
    Fair,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::First => "first",
            Strategy::Random => "random",
            Strategy::RoundRobin => "round-robin",
            Strategy::Fair => "fair",
        };
        f.write_str(name)
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(Strategy::First),
            "random" => Ok(Strategy::Random),
            "round-robin" | "roundrobin" | "round_robin" => Ok(Strategy::RoundRobin),
            "fair" => Ok(Strategy::Fair),
            other => Err(format!("unknown load balancing strategy '{}'", other)),
        }
    }
}

/// Errors from backend selection.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// No backends are configured for the host.
    #[error("No route configured for host '{0}'")]
    RouteNotFound(String),

    /// The strategy cannot select backends.
    #[error("Load balancing strategy '{0}' is not implemented")]
    UnsupportedStrategy(Strategy),

    /// The round-robin rotation for a route is no longer running.
    #[error("Round-robin rotation for '{0}' has stopped")]
    RotationStopped(String),
}

impl BalancerError {
    /// HTTP status a client should receive for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BalancerError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            BalancerError::UnsupportedStrategy(_) => StatusCode::NOT_IMPLEMENTED,
            BalancerError::RotationStopped(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

struct Rotation {
    rx: Mutex<mpsc::Receiver<String>>,
}

/// Routes logical hosts to backend addresses.
pub struct LoadBalancer {
    strategy: Strategy,
    routes: HashMap<String, Vec<String>>,
    rotations: HashMap<String, Rotation>,
}

impl LoadBalancer {
    /// Create a balancer over `routes`.
    ///
    /// Routes with no backends are kept so lookups report them as not found.
    ///
    /// # Panics
    ///
    /// With [`Strategy::RoundRobin`] this spawns one rotation task per route
    /// and so must be called from within a Tokio runtime.
    pub fn new(strategy: Strategy, routes: HashMap<String, Vec<String>>) -> Self {
        let mut rotations = HashMap::new();
        if strategy == Strategy::RoundRobin {
            for (host, backends) in &routes {
                if backends.is_empty() {
                    continue;
                }
                let (tx, rx) = mpsc::channel(ROTATION_BUFFER);
                tokio::spawn(rotate(backends.clone(), tx));
                rotations.insert(host.clone(), Rotation { rx: Mutex::new(rx) });
            }
        }

        debug!(
            "Load balancer ready: strategy={}, routes={}",
            strategy,
            routes.len()
        );

        Self {
            strategy,
            routes,
            rotations,
        }
    }

    /// Pick the backend that should serve a request for `host`.
    ///
    /// # Errors
    ///
    /// - [`BalancerError::RouteNotFound`] if `host` has no backends
    /// - [`BalancerError::UnsupportedStrategy`] for [`Strategy::Fair`]
    /// - [`BalancerError::RotationStopped`] if a round-robin task has exited
    pub async fn choose_host(&self, host: &str) -> Result<String, BalancerError> {
        let backends = match self.routes.get(host) {
            Some(backends) if !backends.is_empty() => backends,
            _ => return Err(BalancerError::RouteNotFound(host.to_string())),
        };

        match self.strategy {
            Strategy::First => Ok(backends[0].clone()),
            Strategy::Random => Ok(pick_random(backends).to_string()),
            Strategy::RoundRobin => {
                let rotation = self
                    .rotations
                    .get(host)
                    .ok_or_else(|| BalancerError::RotationStopped(host.to_string()))?;
                let mut rx = rotation.rx.lock().await;
                rx.recv()
                    .await
                    .ok_or_else(|| BalancerError::RotationStopped(host.to_string()))
            }
            Strategy::Fair => Err(BalancerError::UnsupportedStrategy(Strategy::Fair)),
        }
    }

    /// Route lookup key for a `Host` header value.
    ///
    /// Tries the value as given, then without its port.
    fn route_key<'a>(&self, host: &'a str) -> &'a str {
        if self.routes.contains_key(host) {
            return host;
        }
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy)
            .field("routes", &self.routes)
            .finish()
    }
}

fn pick_random(backends: &[String]) -> &str {
    let index = rand::thread_rng().gen_range(0..backends.len());
    &backends[index]
}

/// Publish `backends` in order, forever, until the receiver goes away.
async fn rotate(backends: Vec<String>, tx: mpsc::Sender<String>) {
    for backend in backends.iter().cycle() {
        if tx.send(backend.clone()).await.is_err() {
            trace!("Rotation receiver dropped; stopping");
            return;
        }
    }
}

#[async_trait]
impl ProxyHandler for LoadBalancer {
    async fn handle_proxy(&self, mut session: ProxySession) -> Response<ProxyBody> {
        let host = session
            .request()
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| session.request().uri().host())
            .unwrap_or_default()
            .to_string();
        let key = self.route_key(&host).to_string();

        let backend = match self.choose_host(&key).await {
            Ok(backend) => backend,
            Err(e) => {
                debug!("No backend for '{}': {}", host, e);
                return ProxyError::from(e).into_response();
            }
        };

        let path = session
            .request()
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/")
            .to_string();
        let rewritten = Uri::builder()
            .scheme("http")
            .authority(backend.as_str())
            .path_and_query(path)
            .build();
        match rewritten {
            Ok(uri) => *session.request_mut().uri_mut() = uri,
            Err(e) => {
                warn!("Backend '{}' for '{}' is not a valid authority: {}", backend, host, e);
                return ProxyError::InvalidRequest(e.to_string()).into_response();
            }
        }

        let client_addr = session.remote_addr().to_string();
        if let Ok(value) = HeaderValue::from_str(&client_addr) {
            session
                .request_mut()
                .headers_mut()
                .append(X_FORWARDED_FOR, value);
        }

        debug!("Routing '{}' to {}", host, backend);
        match session.finish().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Backend {} failed: {}", backend, e);
                e.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes(host: &str, backends: &[&str]) -> HashMap<String, Vec<String>> {
        let mut routes = HashMap::new();
        routes.insert(
            host.to_string(),
            backends.iter().map(|b| b.to_string()).collect(),
        );
        routes
    }

    #[tokio::test]
    async fn test_first_always_same_backend() {
        let lb = LoadBalancer::new(Strategy::First, routes("app", &["a:1", "b:2", "c:3"]));
        for _ in 0..20 {
            assert_eq!(lb.choose_host("app").await.unwrap(), "a:1");
        }
    }

    #[tokio::test]
    async fn test_random_is_roughly_uniform() {
        let lb = LoadBalancer::new(Strategy::Random, routes("app", &["A", "B", "C"]));
        let mut counts: HashMap<String, usize> = HashMap::new();
        let trials = 10_000;
        for _ in 0..trials {
            *counts.entry(lb.choose_host("app").await.unwrap()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        let expected = trials / 3;
        for (backend, count) in counts {
            let deviation = (count as i64 - expected as i64).unsigned_abs() as usize;
            assert!(
                deviation < expected / 5,
                "{} chosen {} times, expected about {}",
                backend,
                count,
                expected
            );
        }
    }

    #[tokio::test]
    async fn test_round_robin_order() {
        let lb = LoadBalancer::new(Strategy::RoundRobin, routes("app", &["A", "B"]));
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(lb.choose_host("app").await.unwrap());
        }
        assert_eq!(seen, vec!["A", "B", "A", "B", "A", "B"]);
    }

    #[tokio::test]
    async fn test_route_not_found() {
        let lb = LoadBalancer::new(Strategy::First, routes("app", &["A"]));
        let err = lb.choose_host("other").await.unwrap_err();
        assert!(matches!(err, BalancerError::RouteNotFound(ref h) if h == "other"));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_route_is_not_found() {
        let lb = LoadBalancer::new(Strategy::RoundRobin, routes("app", &[]));
        let err = lb.choose_host("app").await.unwrap_err();
        assert!(matches!(err, BalancerError::RouteNotFound(_)));
    }

    #[tokio::test]
    async fn test_fair_fails_cleanly() {
        let lb = LoadBalancer::new(Strategy::Fair, routes("app", &["A"]));
        let err = lb.choose_host("app").await.unwrap_err();
        assert!(matches!(err, BalancerError::UnsupportedStrategy(Strategy::Fair)));
    }

    #[test]
    fn test_strategy_parse_and_display() {
        assert_eq!("round-robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("RANDOM".parse::<Strategy>().unwrap(), Strategy::Random);
        assert!("weighted".parse::<Strategy>().is_err());
        assert_eq!(Strategy::RoundRobin.to_string(), "round-robin");
        assert_eq!(Strategy::default(), Strategy::First);
    }

    #[tokio::test]
    async fn test_route_key_strips_port() {
        let lb = LoadBalancer::new(Strategy::First, routes("app.local", &["A"]));
        assert_eq!(lb.route_key("app.local:8080"), "app.local");
        assert_eq!(lb.route_key("app.local"), "app.local");
        assert_eq!(lb.route_key("other:80"), "other");
    }
}
