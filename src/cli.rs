//! Command-line interface definitions for waypost.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Forward HTTP/HTTPS proxy with TLS interception, load balancing and
/// request moderation.
///
/// Without a subcommand waypost runs the proxy. Settings come from
/// `/etc/waypost/config.toml`, the user config file, `--config` and the flags
/// below, in increasing priority.
#[derive(Parser, Debug)]
#[command(name = "waypost")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run (defaults to `run`).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Listen address, overriding `proxy.host` and `proxy.port`.
    #[arg(short = 'l', long = "listen", value_name = "HOST:PORT")]
    pub listen: Option<String>,

    /// Intercept CONNECT tunnels with forged certificates.
    #[arg(long = "intercept")]
    pub intercept: bool,

    /// Hold every request until an operator approves it.
    #[arg(long = "moderate")]
    pub moderate: bool,

    /// Do not read operator commands from stdin.
    #[arg(long = "no-console")]
    pub no_console: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for waypost.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the proxy (default).
    Run,

    /// Ensure the interception CA exists and print its certificate.
    ///
    /// Install the printed PEM into client trust stores so intercepted
    /// connections validate.
    Ca,
}

impl Cli {
    /// The subcommand to run.
    pub fn selected_command(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }

    /// Parse a `HOST:PORT` listen address.
    ///
    /// IPv6 hosts are written in brackets (`[::1]:8080`). Returns `None` if
    /// the format is invalid.
    pub fn parse_listen(listen: &str) -> Option<(String, u16)> {
        let (host, port) = listen.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some((host.to_string(), port))
    }
}
