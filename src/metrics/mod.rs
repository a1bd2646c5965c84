//! Prometheus metrics for monitoring
//!
//! Components receive an `Arc<dyn Metrics>` at construction; the Prometheus
//! implementation keeps its collectors in a private registry that the
//! metrics server exposes.

use crate::error::{RelayerError, RelayerResult};

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Result of a single `check_and_relay` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Success,
    Failure,
}

impl CheckOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            CheckOutcome::Success => "success",
            CheckOutcome::Failure => "failure",
        }
    }
}

/// Final state of a submitted relay transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Success,
    Failed,
    Timeout,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Success => "success",
            TxStatus::Failed => "failed",
            TxStatus::Timeout => "timeout",
        }
    }
}

/// Metrics sink shared by the relay engine
pub trait Metrics: Send + Sync {
    fn record_tunnel_check(&self, tunnel_id: u64, outcome: CheckOutcome, elapsed: Duration);
    fn record_penalty(&self, tunnel_id: u64, penalty: Duration);
    fn record_packet_received(&self, tunnel_id: u64);
    fn record_packet_relayed(&self, tunnel_id: u64, chain: &str);
    fn record_tx(&self, chain: &str, status: TxStatus);
    fn record_gas_fallback(&self, chain: &str);
    fn record_pending_signing_added(&self);
    fn record_pending_signings_removed(&self, count: u64);
    fn set_active_tunnels(&self, count: usize);
}

/// Prometheus-backed metrics
pub struct PrometheusMetrics {
    registry: Registry,
    tunnel_checks: IntCounterVec,
    check_duration: HistogramVec,
    tunnel_penalty: GaugeVec,
    packets_received: IntCounterVec,
    packets_relayed: IntCounterVec,
    txs: IntCounterVec,
    gas_fallbacks: IntCounterVec,
    pending_signings: IntGauge,
    active_tunnels: IntGauge,
}

impl PrometheusMetrics {
    pub fn new() -> RelayerResult<Self> {
        let registry = Registry::new_custom(Some("tunnel_relayer".to_string()), None)?;

        let tunnel_checks = IntCounterVec::new(
            Opts::new("tunnel_checks_total", "Total tunnel checks by outcome"),
            &["tunnel_id", "outcome"],
        )?;
        let check_duration = HistogramVec::new(
            HistogramOpts::new(
                "tunnel_check_duration_seconds",
                "Duration of a check-and-relay invocation",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
            &["tunnel_id"],
        )?;
        let tunnel_penalty = GaugeVec::new(
            Opts::new(
                "tunnel_penalty_seconds",
                "Current delay before the next scheduled check",
            ),
            &["tunnel_id"],
        )?;
        let packets_received = IntCounterVec::new(
            Opts::new("packets_received_total", "New packet events received"),
            &["tunnel_id"],
        )?;
        let packets_relayed = IntCounterVec::new(
            Opts::new("packets_relayed_total", "Packets relayed to the target chain"),
            &["tunnel_id", "chain"],
        )?;
        let txs = IntCounterVec::new(
            Opts::new("transactions_total", "Relay transactions by final status"),
            &["chain", "status"],
        )?;
        let gas_fallbacks = IntCounterVec::new(
            Opts::new(
                "gas_fallbacks_total",
                "Gas quotes that fell back to the configured default",
            ),
            &["chain"],
        )?;
        let pending_signings = IntGauge::new(
            "pending_signings",
            "Signings cached while waiting for completion",
        )?;
        let active_tunnels = IntGauge::new("active_tunnels", "Tunnels with a running relayer")?;

        registry.register(Box::new(tunnel_checks.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;
        registry.register(Box::new(tunnel_penalty.clone()))?;
        registry.register(Box::new(packets_received.clone()))?;
        registry.register(Box::new(packets_relayed.clone()))?;
        registry.register(Box::new(txs.clone()))?;
        registry.register(Box::new(gas_fallbacks.clone()))?;
        registry.register(Box::new(pending_signings.clone()))?;
        registry.register(Box::new(active_tunnels.clone()))?;

        Ok(Self {
            registry,
            tunnel_checks,
            check_duration,
            tunnel_penalty,
            packets_received,
            packets_relayed,
            txs,
            gas_fallbacks,
            pending_signings,
            active_tunnels,
        })
    }

    #[cfg(test)]
    pub fn pending_signings(&self) -> i64 {
        self.pending_signings.get()
    }

    #[cfg(test)]
    pub fn tunnel_checks(&self, tunnel_id: u64, outcome: CheckOutcome) -> u64 {
        self.tunnel_checks
            .with_label_values(&[&tunnel_id.to_string(), outcome.as_str()])
            .get()
    }

    #[cfg(test)]
    pub fn active_tunnels(&self) -> i64 {
        self.active_tunnels.get()
    }

    #[cfg(test)]
    pub fn gas_fallbacks(&self, chain: &str) -> u64 {
        self.gas_fallbacks.with_label_values(&[chain]).get()
    }

    /// Render all collectors in the text exposition format
    pub fn encode(&self) -> RelayerResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| RelayerError::Internal(e.to_string()))
    }
}

impl Metrics for PrometheusMetrics {
    fn record_tunnel_check(&self, tunnel_id: u64, outcome: CheckOutcome, elapsed: Duration) {
        let tunnel_id = tunnel_id.to_string();
        self.tunnel_checks
            .with_label_values(&[&tunnel_id, outcome.as_str()])
            .inc();
        self.check_duration
            .with_label_values(&[&tunnel_id])
            .observe(elapsed.as_secs_f64());
    }

    fn record_penalty(&self, tunnel_id: u64, penalty: Duration) {
        self.tunnel_penalty
            .with_label_values(&[&tunnel_id.to_string()])
            .set(penalty.as_secs_f64());
    }

    fn record_packet_received(&self, tunnel_id: u64) {
        self.packets_received
            .with_label_values(&[&tunnel_id.to_string()])
            .inc();
    }

    fn record_packet_relayed(&self, tunnel_id: u64, chain: &str) {
        self.packets_relayed
            .with_label_values(&[&tunnel_id.to_string(), chain])
            .inc();
    }

    fn record_tx(&self, chain: &str, status: TxStatus) {
        self.txs.with_label_values(&[chain, status.as_str()]).inc();
    }

    fn record_gas_fallback(&self, chain: &str) {
        self.gas_fallbacks.with_label_values(&[chain]).inc();
    }

    fn record_pending_signing_added(&self) {
        self.pending_signings.inc();
    }

    fn record_pending_signings_removed(&self, count: u64) {
        self.pending_signings.sub(count as i64);
    }

    fn set_active_tunnels(&self, count: usize) {
        self.active_tunnels.set(count as i64);
    }
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
    metrics: Arc<PrometheusMetrics>,
}

impl MetricsServer {
    pub fn new(port: u16, metrics: Arc<PrometheusMetrics>) -> Self {
        Self { port, metrics }
    }

    /// Serve `/metrics` until the shutdown signal fires
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> RelayerResult<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.metrics);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Config(format!("Cannot bind metrics port: {}", e)))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| RelayerError::Internal(format!("Metrics server failed: {}", e)))?;

        info!("Metrics server stopped");
        Ok(())
    }
}

async fn metrics_handler(
    State(metrics): State<Arc<PrometheusMetrics>>,
) -> Result<String, StatusCode> {
    metrics.encode().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
