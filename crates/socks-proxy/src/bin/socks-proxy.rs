//! SOCKS5 Proxy Server
//!
//! Runs the proxy with Prometheus metrics; the first SIGINT/SIGTERM drains
//! in-flight sessions, a second one exits immediately.

use anyhow::{Context, Result};
use clap::Parser;
use socks_proxy::{
    metrics::{bind_metrics_listener, serve_metrics_on},
    ConnectionObserver, NoopObserver, PrometheusObserver, ProxyConfig, ProxyServer,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(
    name = "socks-proxy",
    about = "SOCKS5 CONNECT proxy without authentication",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind_host: Option<IpAddr>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    pool_capacity: Option<usize>,

    /// Metrics listen address
    #[arg(long, value_name = "ADDR")]
    metrics_addr: Option<String>,

    /// Disable the metrics endpoint
    #[arg(long)]
    no_metrics: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    };

    setup_logging(&config.log_level, cli.verbose);
    info!("Welcome to socks-proxy {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        process::exit(1);
    }
    info!("Shutdown done.");
}

async fn load_config(cli: &Cli) -> Result<ProxyConfig> {
    let mut config = match &cli.config {
        Some(path) => ProxyConfig::load_from_file(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ProxyConfig::default(),
    };

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.bind_host {
        config.bind_host = host;
    }
    if let Some(capacity) = cli.pool_capacity {
        config.pool_capacity = capacity;
    }
    if let Some(addr) = &cli.metrics_addr {
        config.metrics.bind_address = addr.clone();
    }
    if cli.no_metrics {
        config.metrics.enabled = false;
    }

    config.validate()?;
    Ok(config)
}

fn setup_logging(level: &str, verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

async fn run(config: ProxyConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let observer: Arc<dyn ConnectionObserver> = if config.metrics.enabled {
        let metrics = Arc::new(PrometheusObserver::new()?);
        let listener = bind_metrics_listener(&config.metrics.bind_address)
            .await
            .context("Failed to start metrics server")?;
        let path = config.metrics.path.clone();
        let token = shutdown.clone();
        let exporter = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics_on(listener, exporter, &path, token).await {
                error!("Metrics server error: {}", e);
            }
        });
        metrics
    } else {
        Arc::new(NoopObserver)
    };

    let server = ProxyServer::bind(config, observer)
        .await
        .context("Failed to start SOCKS5 server")?;
    server.serve(shutdown).await?;

    Ok(())
}

/// First signal cancels `shutdown`; a second one forces the process to exit
async fn watch_signals(shutdown: CancellationToken) {
    let mut count = 0u32;
    loop {
        if let Err(e) = wait_for_signal().await {
            error!("Failed to listen for shutdown signals: {}", e);
            return;
        }
        count += 1;
        debug!("Received shutdown signal, count: {}", count);

        if count == 1 {
            info!("First signal received, initiating graceful shutdown...");
            shutdown.cancel();
        } else {
            warn!("Received signal again, force exit.");
            process::exit(1);
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
