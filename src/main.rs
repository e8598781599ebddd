//! lensproxy binary entry point.
//!
//! Handles CLI parsing, config loading, tracing setup, and runs the proxy
//! frontend until ctrl-c.

use anyhow::{Context, Result};
use clap::Parser;
use lensproxy::{
    cli::Cli,
    config::Config,
    proxy::{ContextCache, DecryptPolicy, ProxyConfig, ProxyServer},
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;

    debug!("Parsed CLI arguments: {:?}", cli);

    // Load configuration, then let CLI flags win
    let mut config =
        Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.apply_cli(&cli).context("Failed to apply CLI overrides")?;

    debug!("Effective configuration: {:?}", config);

    let policy = Arc::new(DecryptPolicy::new(
        config.decrypt.enabled,
        config.decrypt.mode,
        config.decrypt.hosts.clone(),
    ));
    let cache = Arc::new(ContextCache::with_settings(
        config.cache.capacity,
        config.ca.leaf_validity_days,
        config.ca.key_profile,
    ));

    if cli.print_root_ca {
        // Materializes the root so clients can trust it before the first
        // intercepted connection.
        let pem = cache.root_cert_pem().context("Failed to export root CA")?;
        println!("{}", pem);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_config = ProxyConfig {
        listen_host: config.listen.host.clone(),
        listen_port: config.listen.port,
    };
    let server = ProxyServer::bind(&proxy_config, policy, cache, shutdown_rx)
        .await
        .context("Failed to start proxy")?;

    info!(
        "lensproxy listening on {} (decrypt {})",
        server.local_addr()?,
        if config.decrypt.enabled { "on" } else { "off" }
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run().await.context("Proxy server failed")?;

    Ok(())
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): Only warnings and errors
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
