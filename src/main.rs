//! Tunnel Relayer - delivers signed BandChain tunnel packets to EVM chains
//!
//! Every configured tunnel is polled on its own schedule with penalty
//! backoff, and chain events wake a tunnel as soon as its packet is signed.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

mod app;
mod band;
mod chain;
mod config;
mod error;
mod gas;
mod metrics;
mod relayer;
mod types;

#[cfg(test)]
mod test_utils;

use app::{event_channels, App};
use band::RestBandClient;
use config::Settings;
use metrics::PrometheusMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Tunnel Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!("Loaded configuration for {} chains", settings.chains.len());

    let metrics = Arc::new(PrometheusMetrics::new()?);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    let band_client = Arc::new(RestBandClient::new(&settings.bandchain)?);
    let chain_providers = chain::build_chain_providers(&settings, metrics.clone())?;
    info!("Chain providers configured");

    // No BandChain event subscriber ships here; one plugs in by cloning
    // `event_senders`, and holding them keeps the event arms of `run` open
    let (event_senders, event_receivers) = event_channels();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = App::new(settings, band_client, chain_providers, metrics);
    let app_handle = tokio::spawn(app.run(event_receivers, shutdown_rx));

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");
    let _ = shutdown_tx.send(true);
    app_handle.await??;
    drop(event_senders);

    info!("Tunnel Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,tunnel_relayer=debug,hyper=warn,reqwest=warn")
    });

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("RELAYER_LOG_JSON").is_ok_and(|v| v == "1") {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
