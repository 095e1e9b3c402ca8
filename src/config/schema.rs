//! Configuration schema definitions.
//!
//! This module defines the structure of the waypost configuration files.
//! Every value is optional in a file; unset values fall back to built-in
//! defaults when the merged configuration is resolved.
//!
//! ```toml
//! [proxy]
//! host = "0.0.0.0"
//! port = 3128
//! use_env_proxy = true
//! loop_test_url = "http://example.com/"
//!
//! [interceptor]
//! enabled = true
//! preload_hosts = ["example.com"]
//!
//! [moderation]
//! enabled = false
//!
//! [balancer]
//! strategy = "round-robin"
//!
//! [balancer.routes]
//! "app.internal" = ["10.0.0.1:8080", "10.0.0.2:8080"]
//! ```

use super::error::ConfigError;
use crate::intercept::InterceptorConfig;
use crate::proxy::{ProxyConfig, Strategy, DEFAULT_PROXY_AGENT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Directory name under the user's data directory for certificates.
pub const DATA_DIR_NAME: &str = "waypost";

/// Default listen address.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Listener and outbound settings.
    #[serde(default)]
    pub proxy: ProxySection,

    /// SSL interception settings.
    #[serde(default)]
    pub interceptor: InterceptorSection,

    /// Request moderation settings.
    #[serde(default)]
    pub moderation: ModerationSection,

    /// Load balancing settings.
    #[serde(default)]
    pub balancer: BalancerSection,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Values set in `other` override; route tables merge by host and
    /// preload lists are appended.
    pub fn merge(&mut self, other: Config) {
        self.proxy.merge(other.proxy);
        self.interceptor.merge(other.interceptor);
        self.moderation.merge(other.moderation);
        self.balancer.merge(other.balancer);
    }

    /// Resolve the proxy server settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if only one of `tls_cert` and
    /// `tls_key` is set, or the port is zero.
    pub fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let proxy = &self.proxy;

        if proxy.tls_cert.is_some() != proxy.tls_key.is_some() {
            return Err(ConfigError::InvalidValue {
                field: "proxy.tls_cert".to_string(),
                message: "tls_cert and tls_key must be set together".to_string(),
            });
        }

        let port = proxy.port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "proxy.port".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }

        Ok(ProxyConfig {
            host: proxy.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            proxy_agent: proxy
                .proxy_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_PROXY_AGENT.to_string()),
            use_env_proxy: proxy.use_env_proxy.unwrap_or(false),
            loop_test_url: proxy.loop_test_url.clone().filter(|u| !u.is_empty()),
            upstream_timeout: match proxy.upstream_timeout_secs.unwrap_or(0) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            tls_cert: proxy.tls_cert.clone(),
            tls_key: proxy.tls_key.clone(),
        })
    }

    /// Resolve the interceptor's certificate locations.
    pub fn interceptor_config(&self) -> InterceptorConfig {
        let base = data_dir();
        let section = &self.interceptor;
        InterceptorConfig {
            ca_cert: section
                .ca_cert
                .clone()
                .unwrap_or_else(|| base.join("ca_cert.pem")),
            ca_key: section
                .ca_key
                .clone()
                .unwrap_or_else(|| base.join("ca_key.pem")),
            host_cert_dir: section
                .host_cert_dir
                .clone()
                .unwrap_or_else(|| base.join("hosts")),
        }
    }

    /// Whether CONNECT tunnels are intercepted.
    pub fn intercept_enabled(&self) -> bool {
        self.interceptor.enabled.unwrap_or(false)
    }

    /// Whether moderation starts enabled.
    pub fn moderation_enabled(&self) -> bool {
        self.moderation.enabled.unwrap_or(false)
    }

    /// Load balancing strategy.
    pub fn strategy(&self) -> Strategy {
        self.balancer.strategy.unwrap_or_default()
    }

    /// Validate the route table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for an empty backend address.
    pub fn routes(&self) -> Result<HashMap<String, Vec<String>>, ConfigError> {
        for (host, backends) in &self.balancer.routes {
            if backends.iter().any(|b| b.trim().is_empty()) {
                return Err(ConfigError::InvalidValue {
                    field: format!("balancer.routes.{}", host),
                    message: "backend address must not be empty".to_string(),
                });
            }
        }
        Ok(self.balancer.routes.clone())
    }
}

/// Where certificates live when no path is configured.
fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join(DATA_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(".").join(DATA_DIR_NAME))
}

/// `[proxy]` section.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProxySection {
    /// Address to listen on.
    #[serde(default)]
    pub host: Option<String>,

    /// Port to listen on.
    #[serde(default)]
    pub port: Option<u16>,

    /// `Proxy-agent` header for CONNECT responses.
    #[serde(default)]
    pub proxy_agent: Option<String>,

    /// Use `HTTP_PROXY` / `HTTPS_PROXY` for outbound requests.
    #[serde(default)]
    pub use_env_proxy: Option<bool>,

    /// External URL probed to detect an upstream proxy loop.
    #[serde(default)]
    pub loop_test_url: Option<String>,

    /// Outbound round-trip deadline in seconds. 0 = no timeout.
    #[serde(default)]
    pub upstream_timeout_secs: Option<u64>,

    /// Certificate for serving the listener over TLS.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    /// Private key for serving the listener over TLS.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

impl ProxySection {
    fn merge(&mut self, other: ProxySection) {
        // Scalars are overridden when set
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.proxy_agent.is_some() {
            self.proxy_agent = other.proxy_agent;
        }
        if other.use_env_proxy.is_some() {
            self.use_env_proxy = other.use_env_proxy;
        }
        if other.loop_test_url.is_some() {
            self.loop_test_url = other.loop_test_url;
        }
        if other.upstream_timeout_secs.is_some() {
            self.upstream_timeout_secs = other.upstream_timeout_secs;
        }
        if other.tls_cert.is_some() {
            self.tls_cert = other.tls_cert;
        }
        if other.tls_key.is_some() {
            self.tls_key = other.tls_key;
        }
    }
}

/// `[interceptor]` section.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct InterceptorSection {
    /// Intercept CONNECT tunnels.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// CA certificate path.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    /// CA private key path.
    #[serde(default)]
    pub ca_key: Option<PathBuf>,

    /// Directory for per-host leaf certificates.
    #[serde(default)]
    pub host_cert_dir: Option<PathBuf>,

    /// Hosts whose certificates are generated at startup.
    #[serde(default)]
    pub preload_hosts: Vec<String>,
}

impl InterceptorSection {
    fn merge(&mut self, other: InterceptorSection) {
        if other.enabled.is_some() {
            self.enabled = other.enabled;
        }
        if other.ca_cert.is_some() {
            self.ca_cert = other.ca_cert;
        }
        if other.ca_key.is_some() {
            self.ca_key = other.ca_key;
        }
        if other.host_cert_dir.is_some() {
            self.host_cert_dir = other.host_cert_dir;
        }

        // Lists are merged (appended, deduplicated)
        for host in other.preload_hosts {
            if !self.preload_hosts.contains(&host) {
                self.preload_hosts.push(host);
            }
        }
    }
}

/// `[moderation]` section.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ModerationSection {
    /// Hold requests for approval from startup.
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl ModerationSection {
    fn merge(&mut self, other: ModerationSection) {
        if other.enabled.is_some() {
            self.enabled = other.enabled;
        }
    }
}

/// `[balancer]` section.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BalancerSection {
    /// Backend selection strategy.
    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// Logical host to ordered backend addresses.
    ///
    /// Requests are load balanced only when this table is non-empty.
    #[serde(default)]
    pub routes: HashMap<String, Vec<String>>,
}

impl BalancerSection {
    fn merge(&mut self, other: BalancerSection) {
        if other.strategy.is_some() {
            self.strategy = other.strategy;
        }
        // Maps are merged (later values override)
        self.routes.extend(other.routes);
    }
}
