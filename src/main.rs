//! Resilience gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http server ──▶ rate limiter ──▶ circuit breaker ──▶ downstream
//!                          │               │                 │
//!                          │               ▼                 ▼
//!                          │         cache selector      fallbacks
//!                          │        (memory / redis)
//!                          ▼
//!                  /health, /metrics, /metrics/prometheus, /cache/stats
//! ```
//!
//! Startup order: config, logging, metrics, gateway, downstream actions,
//! config watcher, listener.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use resilience_gateway::config::watcher::ConfigWatcher;
use resilience_gateway::config::{load_config, GatewayConfig};
use resilience_gateway::http::{register_downstreams, HttpServer};
use resilience_gateway::observability::{logging, metrics};
use resilience_gateway::Gateway;

#[derive(Parser)]
#[command(name = "resilience-gateway")]
#[command(about = "Circuit breaking, rate limiting gateway with a switchable cache", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    logging::init_logging(&config.observability)?;
    tracing::info!("resilience-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        cache_strategy = %config.cache.strategy,
        rate_limit_points = config.rate_limit.points,
        profiles = config.breakers.profiles.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    "Failed to parse metrics address"
                );
            }
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let local_addr = listener.local_addr()?;

    let gateway = Arc::new(Gateway::new(config));
    let registered = register_downstreams(&gateway)?;
    tracing::info!(actions = registered, "Downstream actions registered");

    let tasks = gateway.start().await;

    // Keep the watcher alive for the lifetime of the server.
    let _watcher = match &cli.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let reloader = gateway.clone();
            tokio::spawn(async move {
                while let Some(new_config) = updates.recv().await {
                    reloader.apply_config(&new_config).await;
                }
            });
            match watcher.run() {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(error = %e, "Config hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    tracing::info!(address = %local_addr, "Listening for connections");

    let server = HttpServer::new(gateway.clone());
    server.run(listener).await?;

    for task in tasks {
        let _ = task.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
