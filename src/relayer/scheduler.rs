//! Per-tunnel polling with exponential penalty backoff

use super::TunnelRelayer;
use crate::config::GlobalConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::metrics::Metrics;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Capacity of the queue of relayers added at runtime
const NEW_RELAYER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Interval between checks of a healthy tunnel
    pub check_interval: Duration,
    /// Upper bound on the interval after repeated failures
    pub max_penalty: Duration,
    /// Growth of the interval per consecutive failure
    pub penalty_factor: f64,
}

impl SchedulerConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            check_interval: global.checking_packet_interval(),
            max_penalty: global.max_checking_packet_penalty(),
            penalty_factor: global.penalty_exponential_factor,
        }
    }
}

/// Backoff state of one tunnel
#[derive(Debug, Clone)]
pub struct Penalty {
    config: SchedulerConfig,
    failures: u32,
}

impl Penalty {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// `min(max_penalty, check_interval * penalty_factor^failures)`
    pub fn interval(&self) -> Duration {
        let exponent = i32::try_from(self.failures).unwrap_or(i32::MAX);
        let secs = self.config.check_interval.as_secs_f64() * self.config.penalty_factor.powi(exponent);

        Duration::try_from_secs_f64(secs)
            .map(|interval| interval.min(self.config.max_penalty))
            .unwrap_or(self.config.max_penalty)
    }
}

/// Adds relayers to a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    relayer_tx: mpsc::Sender<Arc<TunnelRelayer>>,
}

impl SchedulerHandle {
    pub async fn add_relayer(&self, relayer: Arc<TunnelRelayer>) -> RelayerResult<()> {
        let tunnel_id = relayer.tunnel_id();
        self.relayer_tx
            .send(relayer)
            .await
            .map_err(|_| {
                RelayerError::Internal(format!("Scheduler stopped, cannot add tunnel {}", tunnel_id))
            })
    }
}

/// Runs one polling loop per tunnel and forwards triggers to them
pub struct Scheduler {
    config: SchedulerConfig,
    metrics: Arc<dyn Metrics>,
    trigger_rx: mpsc::Receiver<u64>,
    relayer_rx: mpsc::Receiver<Arc<TunnelRelayer>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        metrics: Arc<dyn Metrics>,
        trigger_rx: mpsc::Receiver<u64>,
    ) -> (Self, SchedulerHandle) {
        let (relayer_tx, relayer_rx) = mpsc::channel(NEW_RELAYER_BUFFER);

        let scheduler = Self {
            config,
            metrics,
            trigger_rx,
            relayer_rx,
        };
        (scheduler, SchedulerHandle { relayer_tx })
    }

    /// Drive every relayer until shutdown, then wait for all tunnel loops to
    /// finish their in-flight check
    pub async fn start(
        mut self,
        relayers: Vec<Arc<TunnelRelayer>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        let mut loops = JoinSet::new();
        let mut wakers: HashMap<u64, mpsc::Sender<()>> = HashMap::new();

        for relayer in relayers {
            self.spawn_loop(&mut loops, &mut wakers, relayer, &shutdown);
        }
        info!("Scheduler started with {} tunnels", wakers.len());

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,
                Some(tunnel_id) = self.trigger_rx.recv() => {
                    dispatch_trigger(&wakers, tunnel_id);
                }
                Some(relayer) = self.relayer_rx.recv() => {
                    self.spawn_loop(&mut loops, &mut wakers, relayer, &shutdown);
                }
                Some(joined) = loops.join_next(), if !loops.is_empty() => {
                    if let Err(e) = joined {
                        error!("Tunnel loop ended abnormally: {}", e);
                    }
                }
            }
        }

        drop(wakers);
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!("Tunnel loop ended abnormally: {}", e);
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    fn spawn_loop(
        &self,
        loops: &mut JoinSet<()>,
        wakers: &mut HashMap<u64, mpsc::Sender<()>>,
        relayer: Arc<TunnelRelayer>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let tunnel_id = relayer.tunnel_id();
        if wakers.contains_key(&tunnel_id) {
            debug!("Tunnel {} is already scheduled", tunnel_id);
            return;
        }

        // A single slot: triggers arriving while one is pending are merged
        let (wake_tx, wake_rx) = mpsc::channel(1);
        wakers.insert(tunnel_id, wake_tx);

        loops.spawn(run_tunnel_loop(
            relayer,
            self.config,
            self.metrics.clone(),
            wake_rx,
            shutdown.clone(),
        ));
        debug!("Scheduled tunnel {}", tunnel_id);
    }
}

fn dispatch_trigger(wakers: &HashMap<u64, mpsc::Sender<()>>, tunnel_id: u64) {
    let Some(waker) = wakers.get(&tunnel_id) else {
        debug!("Trigger for unscheduled tunnel {}", tunnel_id);
        return;
    };

    match waker.try_send(()) {
        Ok(()) => debug!("Triggered tunnel {}", tunnel_id),
        Err(TrySendError::Full(())) => debug!("Tunnel {} already has a pending trigger", tunnel_id),
        Err(TrySendError::Closed(())) => warn!("Loop of tunnel {} is gone", tunnel_id),
    }
}

async fn run_tunnel_loop(
    relayer: Arc<TunnelRelayer>,
    config: SchedulerConfig,
    metrics: Arc<dyn Metrics>,
    mut wake_rx: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let tunnel_id = relayer.tunnel_id();
    let mut penalty = Penalty::new(config);
    let mut next_run_at = Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            biased;

            _ = shutdown.changed() => break,
            _ = sleep_until(next_run_at) => {}
            Some(()) = wake_rx.recv() => debug!("Tunnel {} woken by trigger", tunnel_id),
        }

        if relayer.is_executing() {
            debug!("Tunnel {} is still executing, skipping", tunnel_id);
        } else {
            match relayer.check_and_relay().await {
                Ok(()) => penalty.reset(),
                Err(e) if e.is_retryable() => {
                    penalty.record_failure();
                    warn!(
                        "Tunnel {} check failed ({} in a row): {}",
                        tunnel_id,
                        penalty.failures(),
                        e
                    );
                }
                Err(e) => {
                    penalty.record_failure();
                    error!(
                        "Tunnel {} needs attention ({} failures in a row): {}",
                        tunnel_id,
                        penalty.failures(),
                        e
                    );
                }
            }
        }

        let interval = penalty.interval();
        metrics.record_penalty(tunnel_id, interval);
        next_run_at = Instant::now() + interval;
    }

    debug!("Tunnel {} loop stopped", tunnel_id);
}
