//! waypost: forward HTTP/HTTPS proxy
//!
//! This is the main entry point for the waypost binary. It handles CLI argument
//! parsing, configuration loading and logging initialization, then assembles the
//! handler chain and runs the proxy until Ctrl-C.
//!
//! # Handler chain
//!
//! - **Base**: the load balancer when routes are configured, plain forwarding
//!   otherwise
//! - **Moderation**: every request passes the hold-for-approval gate, which is a
//!   no-op while moderation is off
//! - **Interception**: when enabled, CONNECT tunnels are decrypted and each inner
//!   request goes through the moderated chain
//!
//! Logs go to stderr. Stdout belongs to the operator console.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use waypost::{
    cli::{Cli, Commands},
    config::{Config, ConfigLoader},
    console::Console,
    intercept::{ForwardIntercepted, InterceptConnect, SslInterceptor},
    moderation::{MemoryRequestLog, Moderation, ModerationGate},
    proxy::{LoadBalancer, Passthrough, ProxyHandler, ProxyServer},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;

    debug!("Parsed CLI arguments: {:?}", cli);

    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    debug!("Loaded configuration: {:?}", config);

    match cli.selected_command() {
        Commands::Ca => print_ca(&config),
        Commands::Run => run(cli, config).await,
    }
}

/// Ensure the interception CA exists and print its certificate.
fn print_ca(config: &Config) -> Result<()> {
    let interceptor_config = config.interceptor_config();
    let interceptor = SslInterceptor::new(
        &interceptor_config,
        Arc::new(ForwardIntercepted::new(Arc::new(Passthrough))),
    )
    .context("Failed to load interception CA")?;

    eprintln!("CA certificate: {}", interceptor_config.ca_cert.display());
    print!("{}", interceptor.ca().certificate_pem());
    Ok(())
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let proxy_config = config.proxy_config().context("Invalid proxy configuration")?;
    let routes = config.routes().context("Invalid balancer configuration")?;

    let base: Arc<dyn ProxyHandler> = if routes.is_empty() {
        Arc::new(Passthrough)
    } else {
        info!(
            "Load balancing {} host(s) with the {} strategy",
            routes.len(),
            config.strategy()
        );
        Arc::new(LoadBalancer::new(config.strategy(), routes))
    };

    let records = Arc::new(MemoryRequestLog::new());
    let moderation = Arc::new(Moderation::new(records.clone(), config.moderation_enabled()));
    let moderated: Arc<dyn ProxyHandler> =
        Arc::new(ModerationGate::new(moderation.clone(), base));

    let handler: Arc<dyn ProxyHandler> = if config.intercept_enabled() {
        let interceptor = Arc::new(
            SslInterceptor::new(
                &config.interceptor_config(),
                Arc::new(ForwardIntercepted::new(moderated.clone())),
            )
            .context("Failed to set up SSL interception")?,
        );
        if !config.interceptor.preload_hosts.is_empty() {
            interceptor.preload(config.interceptor.preload_hosts.clone());
        }
        Arc::new(InterceptConnect::new(interceptor, moderated))
    } else {
        moderated
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if !cli.no_console {
        let console = Console::new(moderation, Some(records));
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = console.run(stdin, tokio::io::stdout()).await {
                warn!("Console stopped: {}", e);
            }
        });
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    ProxyServer::new(proxy_config, handler, shutdown_rx)
        .run()
        .await
        .context("Proxy server failed")
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, or warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
