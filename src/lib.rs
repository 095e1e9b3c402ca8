//! waypost: forward HTTP/HTTPS proxy
//!
//! This crate provides a forward proxy that relays plain HTTP requests,
//! tunnels `CONNECT` traffic and can optionally decrypt it.
//!
//! # Architecture
//!
//! - **Proxy**: hyper-based listener, outbound transport, CONNECT tunneling and
//!   the load balancer
//! - **Cert**: RSA key pairs and X.509 certificates persisted as PEM
//! - **Intercept**: SSL interception with per-host leaf certificates signed by a
//!   local CA
//! - **Moderation**: hold-for-approval queue for proxied requests
//! - **Config**: Hierarchical TOML configuration
//! - **Console**: stdin commands for the moderation queue

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cert;
pub mod cli;
pub mod config;
pub mod console;
pub mod intercept;
pub mod moderation;
pub mod proxy;
