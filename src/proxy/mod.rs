//! Forward HTTP/HTTPS proxy.
//!
//! This module provides:
//! - A TCP (optionally TLS) listener serving HTTP/1.1 with CONNECT upgrades
//! - Per-request [`ProxySession`]s with outbound relay and raw CONNECT tunnels
//! - The [`ProxyHandler`] seam through which load balancing, moderation and
//!   interception attach
//! - Loop detection for environment-configured upstream proxies
//!
//! # Architecture
//!
//! ```text
//! client ──► ProxyServer ──► ProxyHandler ──► ProxySession::finish
//!                               │                   │
//!                               │                   ├─ CONNECT: dial + tunnel
//!                               │                   └─ other:   Transport::round_trip
//!                               │
//!                   (LoadBalancer / ModerationGate / InterceptConnect / Passthrough)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use waypost::proxy::{LoadBalancer, ProxyConfig, ProxyServer, Strategy};
//! use std::sync::Arc;
//!
//! let balancer = Arc::new(LoadBalancer::new(Strategy::RoundRobin, routes));
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServer::new(ProxyConfig::default(), balancer, shutdown_rx);
//! server.run().await?;
//! ```

pub mod balancer;
pub mod body;
pub mod connect;
pub mod error;
pub mod handler;
pub mod loopcheck;
pub mod server;
pub mod session;
pub mod transport;

// Re-export main types for convenient access
pub use balancer::{BalancerError, LoadBalancer, Strategy};
pub use body::{empty_body, full_body, text_response, ProxyBody};
pub use connect::{connection_established, tunnel};
pub use error::{ProxyError, ProxyResult};
pub use handler::{Passthrough, ProxyHandler};
pub use loopcheck::check_proxy_loop;
pub use server::{serve_inbound, ProxyConfig, ProxyServer, DEFAULT_PROXY_AGENT};
pub use session::{ProxyContext, ProxySession};
pub use transport::{Transport, UpstreamProxy};
