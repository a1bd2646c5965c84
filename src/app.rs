//! Application owner
//!
//! `App` spawns every long-lived task into one `JoinSet` and only returns
//! once all of them have stopped.

use crate::band::BandClient;
use crate::chain::ChainProvider;
use crate::config::Settings;
use crate::error::RelayerResult;
use crate::metrics::{Metrics, MetricsServer, PrometheusMetrics};
use crate::relayer::{
    PacketHandler, Scheduler, SchedulerConfig, SchedulerHandle, SigningCache, SigningResult,
    TunnelRelayer, SIGNING_CACHE_TTL,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 1024;
const TRIGGER_BUFFER: usize = 1024;
const CACHE_EVICTION_INTERVAL: Duration = Duration::from_secs(600);

/// Entry points for chain-event subscribers
#[derive(Clone)]
pub struct EventSenders {
    /// Tunnel IDs that produced a new packet
    pub new_packets: mpsc::Sender<u64>,
    pub signing_results: mpsc::Sender<SigningResult>,
}

pub struct EventReceivers {
    new_packets: mpsc::Receiver<u64>,
    signing_results: mpsc::Receiver<SigningResult>,
}

pub fn event_channels() -> (EventSenders, EventReceivers) {
    let (new_packets_tx, new_packets_rx) = mpsc::channel(EVENT_BUFFER);
    let (signing_results_tx, signing_results_rx) = mpsc::channel(EVENT_BUFFER);

    (
        EventSenders {
            new_packets: new_packets_tx,
            signing_results: signing_results_tx,
        },
        EventReceivers {
            new_packets: new_packets_rx,
            signing_results: signing_results_rx,
        },
    )
}

pub struct App {
    settings: Settings,
    band_client: Arc<dyn BandClient>,
    chain_providers: HashMap<String, Arc<dyn ChainProvider>>,
    metrics: Arc<PrometheusMetrics>,
}

impl App {
    pub fn new(
        settings: Settings,
        band_client: Arc<dyn BandClient>,
        chain_providers: HashMap<String, Arc<dyn ChainProvider>>,
        metrics: Arc<PrometheusMetrics>,
    ) -> Self {
        Self {
            settings,
            band_client,
            chain_providers,
            metrics,
        }
    }

    /// Run until `shutdown` fires and every task has wound down
    pub async fn run(
        self,
        events: EventReceivers,
        shutdown: watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        let EventReceivers {
            new_packets,
            signing_results,
        } = events;
        let metrics: Arc<dyn Metrics> = self.metrics.clone();
        let chain_providers = init_chains(self.chain_providers).await;

        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_BUFFER);
        let (scheduler, scheduler_handle) = Scheduler::new(
            SchedulerConfig::from_global(&self.settings.global),
            metrics.clone(),
            trigger_rx,
        );
        let cache = Arc::new(SigningCache::new(SIGNING_CACHE_TTL, metrics.clone()));
        let packet_handler = Arc::new(PacketHandler::new(
            self.band_client.clone(),
            cache.clone(),
            trigger_tx,
            metrics.clone(),
        ));
        let tunnel_sync = TunnelSync {
            band_client: self.band_client.clone(),
            chain_providers,
            allowed_tunnel_ids: self.settings.global.tunnel_ids.iter().copied().collect(),
            scheduler: scheduler_handle,
            packet_handler: packet_handler.clone(),
            metrics: metrics.clone(),
            scheduled: HashSet::new(),
        };

        let mut tasks: JoinSet<(&'static str, RelayerResult<()>)> = JoinSet::new();

        tasks.spawn({
            let shutdown = shutdown.clone();
            async move { ("scheduler", scheduler.start(Vec::new(), shutdown).await) }
        });

        tasks.spawn({
            let handler = packet_handler.clone();
            let shutdown = shutdown.clone();
            async move {
                handler.handle_new_packet(new_packets, shutdown).await;
                ("new packet handler", Ok(()))
            }
        });

        tasks.spawn({
            let handler = packet_handler.clone();
            let shutdown = shutdown.clone();
            async move {
                handler.handle_signing_result(signing_results, shutdown).await;
                ("signing result handler", Ok(()))
            }
        });

        tasks.spawn({
            let shutdown = shutdown.clone();
            async move {
                cache.run_eviction(CACHE_EVICTION_INTERVAL, shutdown).await;
                ("signing cache sweeper", Ok(()))
            }
        });

        tasks.spawn({
            let period = self.settings.global.sync_tunnels_interval();
            let shutdown = shutdown.clone();
            async move { ("tunnel sync", tunnel_sync.run(period, shutdown).await) }
        });

        if self.settings.metrics.enabled {
            let server = MetricsServer::new(self.settings.metrics.port, self.metrics.clone());
            let shutdown = shutdown.clone();
            tasks.spawn(async move { ("metrics server", server.run(shutdown).await) });
        }

        info!("Tunnel relayer is running");

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!("{} stopped", name),
                Ok((name, Err(e))) => error!("{} failed: {}", name, e),
                Err(e) => error!("Task ended abnormally: {}", e),
            }
        }

        info!("All tasks stopped");
        Ok(())
    }
}

/// Initialize every chain, leaving out the ones that fail
async fn init_chains(
    providers: HashMap<String, Arc<dyn ChainProvider>>,
) -> HashMap<String, Arc<dyn ChainProvider>> {
    let mut ready = HashMap::with_capacity(providers.len());

    for (name, provider) in providers {
        match provider.init().await {
            Ok(()) => {
                info!("Chain {} ready", provider.chain_name());
                ready.insert(name, provider);
            }
            Err(e) => error!(
                "Chain {} failed to initialize, its tunnels will not be relayed: {}",
                name, e
            ),
        }
    }

    ready
}

/// Keeps the scheduler's relayer set in line with BandChain's tunnels
struct TunnelSync {
    band_client: Arc<dyn BandClient>,
    chain_providers: HashMap<String, Arc<dyn ChainProvider>>,
    /// Empty means every tunnel on a configured chain
    allowed_tunnel_ids: HashSet<u64>,
    scheduler: SchedulerHandle,
    packet_handler: Arc<PacketHandler>,
    metrics: Arc<dyn Metrics>,
    scheduled: HashSet<u64>,
}

impl TunnelSync {
    async fn run(
        mut self,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!("Tunnel sync failed: {}", e);
                    }
                }
            }
        }

        Ok(())
    }

    /// Returns the number of tunnels being relayed
    async fn sync_once(&mut self) -> RelayerResult<usize> {
        let tunnels = self.band_client.get_tunnels().await?;
        let mut valid = Vec::new();

        for tunnel in tunnels {
            if !self.allowed_tunnel_ids.is_empty() && !self.allowed_tunnel_ids.contains(&tunnel.id)
            {
                continue;
            }

            let Some(provider) = self.chain_providers.get(&tunnel.target_chain) else {
                debug!(
                    "Tunnel {} targets unconfigured chain {}",
                    tunnel.id, tunnel.target_chain
                );
                continue;
            };
            valid.push(tunnel.id);
            if !tunnel.is_active {
                debug!("Tunnel {} is inactive on BandChain", tunnel.id);
            }

            if self.scheduled.contains(&tunnel.id) {
                continue;
            }

            let relayer = TunnelRelayer::new(
                tunnel.id,
                &tunnel.target_chain,
                &tunnel.target_address,
                self.band_client.clone(),
                provider.clone(),
                self.metrics.clone(),
            );
            self.scheduler.add_relayer(Arc::new(relayer)).await?;
            self.scheduled.insert(tunnel.id);
            info!(
                "Relaying tunnel {} to {} at {}",
                tunnel.id, tunnel.target_chain, tunnel.target_address
            );
        }

        let count = valid.len();
        self.packet_handler.update_valid_tunnel_ids(valid).await;
        self.metrics.set_active_tunnels(count);
        Ok(count)
    }
}
