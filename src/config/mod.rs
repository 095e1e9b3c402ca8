//! Configuration system for waypost.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/waypost/config.toml`
//! 2. User config: `~/.config/waypost/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! No file is required; built-in defaults listen on `127.0.0.1:8080`.
//!
//! # Merge Behavior
//!
//! - **Scalars** (port, strategy, etc.) are **overridden**
//! - **Route tables** are **merged** by host (later values override)
//! - **Preload hosts** are **appended**

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    BalancerSection, Config, InterceptorSection, ModerationSection, ProxySection, DATA_DIR_NAME,
    DEFAULT_HOST, DEFAULT_PORT,
};
