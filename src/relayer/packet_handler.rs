//! Event-driven relay triggers
//!
//! New-packet and signing-result notifications from BandChain are turned into
//! wake-ups for the scheduler, so a signed packet is relayed without waiting
//! for the tunnel's next poll.

use super::signing_cache::{CacheEntry, SigningCache};
use crate::band::BandClient;
use crate::error::RelayerResult;
use crate::metrics::Metrics;
use crate::types::SigningStatus;

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

/// Completion notice for a threshold signing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningResult {
    pub signing_id: u64,
    pub success: bool,
}

pub struct PacketHandler {
    band_client: Arc<dyn BandClient>,
    /// Tunnels this relayer serves
    valid_tunnel_ids: RwLock<HashSet<u64>>,
    cache: Arc<SigningCache>,
    trigger_tx: mpsc::Sender<u64>,
    metrics: Arc<dyn Metrics>,
}

impl PacketHandler {
    pub fn new(
        band_client: Arc<dyn BandClient>,
        cache: Arc<SigningCache>,
        trigger_tx: mpsc::Sender<u64>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            band_client,
            valid_tunnel_ids: RwLock::new(HashSet::new()),
            cache,
            trigger_tx,
            metrics,
        }
    }

    /// Replace the set of tunnels whose events are acted on
    pub async fn update_valid_tunnel_ids(&self, ids: impl IntoIterator<Item = u64>) {
        let ids: HashSet<u64> = ids.into_iter().collect();
        debug!("Watching {} tunnels for packet events", ids.len());
        *self.valid_tunnel_ids.write().await = ids;
    }

    async fn is_valid_tunnel(&self, tunnel_id: u64) -> bool {
        self.valid_tunnel_ids.read().await.contains(&tunnel_id)
    }

    /// Consume new-packet notifications until shutdown or until every
    /// sender is gone
    pub async fn handle_new_packet(
        &self,
        mut new_packets: mpsc::Receiver<u64>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = new_packets.recv() => match received {
                    Some(tunnel_id) => {
                        if let Err(e) = self.on_new_packet(tunnel_id).await {
                            warn!("Failed to handle new packet of tunnel {}: {}", tunnel_id, e);
                        }
                    }
                    None => break,
                },
            }
        }

        info!("New packet handler stopped");
    }

    /// Consume signing-result notifications until shutdown or until every
    /// sender is gone
    pub async fn handle_signing_result(
        &self,
        mut results: mpsc::Receiver<SigningResult>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = results.recv() => match received {
                    Some(result) => self.on_signing_result(result).await,
                    None => break,
                },
            }
        }

        info!("Signing result handler stopped");
    }

    async fn on_new_packet(&self, tunnel_id: u64) -> RelayerResult<()> {
        if !self.is_valid_tunnel(tunnel_id).await {
            debug!("Ignoring packet of unwatched tunnel {}", tunnel_id);
            return Ok(());
        }
        self.metrics.record_packet_received(tunnel_id);

        let tunnel = self.band_client.get_tunnel(tunnel_id).await?;
        if tunnel.latest_sequence == 0 {
            return Ok(());
        }

        let packet = self
            .band_client
            .get_tunnel_packet(tunnel_id, tunnel.latest_sequence)
            .await?;

        let ready = packet
            .authoritative_signing()
            .map_or(false, |signing| signing.status == SigningStatus::Success);
        if ready {
            self.trigger(tunnel_id).await;
            return Ok(());
        }

        for signing in packet.signings() {
            debug!(
                "Tunnel {} sequence {} waits for signing {} (created {:?})",
                tunnel_id, packet.sequence, signing.id, signing.created_at
            );
            self.cache.insert(CacheEntry {
                tunnel_id,
                signing_id: signing.id,
            });
        }
        Ok(())
    }

    async fn on_signing_result(&self, result: SigningResult) {
        let Some(entry) = self.cache.remove(result.signing_id) else {
            return;
        };

        if !result.success {
            warn!(
                "Signing {} of tunnel {} failed, checking tunnel",
                entry.signing_id, entry.tunnel_id
            );
        }
        self.trigger(entry.tunnel_id).await;
    }

    async fn trigger(&self, tunnel_id: u64) {
        if self.trigger_tx.send(tunnel_id).await.is_err() {
            warn!("Scheduler is gone, dropping trigger for tunnel {}", tunnel_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::band::MockBandClient;
    use crate::error::RelayerError;
    use crate::metrics::PrometheusMetrics;
    use crate::relayer::SIGNING_CACHE_TTL;
    use crate::test_utils::{band_tunnel, packet, signed_packet, signing};
    use tokio::sync::mpsc::error::TryRecvError;

    struct Harness {
        handler: Arc<PacketHandler>,
        trigger_rx: mpsc::Receiver<u64>,
        metrics: Arc<PrometheusMetrics>,
    }

    async fn harness(band: MockBandClient, valid: &[u64]) -> Harness {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let cache = Arc::new(SigningCache::new(SIGNING_CACHE_TTL, metrics.clone()));
        let (trigger_tx, trigger_rx) = mpsc::channel(16);
        let handler = Arc::new(PacketHandler::new(
            Arc::new(band),
            cache,
            trigger_tx,
            metrics.clone(),
        ));
        handler.update_valid_tunnel_ids(valid.iter().copied()).await;

        Harness {
            handler,
            trigger_rx,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_unwatched_tunnel_is_ignored() {
        let mut band = MockBandClient::new();
        band.expect_get_tunnel().never();
        let mut h = harness(band, &[1]).await;

        h.handler.on_new_packet(2).await.unwrap();
        assert_eq!(h.trigger_rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_signed_packet_triggers_immediately() {
        let mut band = MockBandClient::new();
        band.expect_get_tunnel()
            .returning(|id| Ok(band_tunnel(id, 4)));
        band.expect_get_tunnel_packet()
            .returning(|id, sequence| Ok(signed_packet(id, sequence, SigningStatus::Success)));
        let mut h = harness(band, &[1]).await;

        h.handler.on_new_packet(1).await.unwrap();

        assert_eq!(h.trigger_rx.try_recv(), Ok(1));
        assert!(h.handler.cache.is_empty());
    }

    #[tokio::test]
    async fn test_pending_signings_are_cached() {
        let mut band = MockBandClient::new();
        band.expect_get_tunnel()
            .returning(|id| Ok(band_tunnel(id, 4)));
        band.expect_get_tunnel_packet().returning(|id, sequence| {
            Ok(packet(
                id,
                sequence,
                Some(signing(41, SigningStatus::Waiting)),
                Some(signing(42, SigningStatus::Waiting)),
            ))
        });
        let mut h = harness(band, &[1]).await;

        h.handler.on_new_packet(1).await.unwrap();

        assert_eq!(h.trigger_rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(h.handler.cache.len(), 2);
        assert_eq!(h.metrics.pending_signings(), 2);
    }

    #[tokio::test]
    async fn test_signing_result_triggers_exactly_once() {
        let h = harness(MockBandClient::new(), &[1]).await;
        let Harness {
            handler,
            mut trigger_rx,
            metrics,
        } = h;
        handler.cache.insert(CacheEntry {
            tunnel_id: 7,
            signing_id: 42,
        });

        let (results_tx, results_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle_signing_result(results_rx, shutdown_rx).await })
        };

        let result = SigningResult {
            signing_id: 42,
            success: true,
        };
        results_tx.send(result).await.unwrap();
        results_tx.send(result).await.unwrap();
        results_tx
            .send(SigningResult {
                signing_id: 99,
                success: true,
            })
            .await
            .unwrap();
        drop(results_tx);
        task.await.unwrap();

        assert_eq!(trigger_rx.try_recv(), Ok(7));
        assert_eq!(trigger_rx.try_recv(), Err(TryRecvError::Empty));
        assert!(handler.cache.is_empty());
        assert_eq!(metrics.pending_signings(), 0);
    }

    #[tokio::test]
    async fn test_lookup_failure_does_not_stop_the_loop() {
        let mut band = MockBandClient::new();
        band.expect_get_tunnel().returning(|id| {
            if id == 1 {
                Err(RelayerError::BandQuery("connection refused".to_string()))
            } else {
                Ok(band_tunnel(id, 2))
            }
        });
        band.expect_get_tunnel_packet()
            .returning(|id, sequence| Ok(signed_packet(id, sequence, SigningStatus::Success)));
        let h = harness(band, &[1, 2]).await;
        let Harness {
            handler,
            mut trigger_rx,
            ..
        } = h;

        let (packets_tx, packets_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle_new_packet(packets_rx, shutdown_rx).await })
        };

        packets_tx.send(1).await.unwrap();
        packets_tx.send(2).await.unwrap();
        drop(packets_tx);
        task.await.unwrap();

        assert_eq!(trigger_rx.try_recv(), Ok(2));
        assert_eq!(trigger_rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_handlers_stop_on_shutdown() {
        let h = harness(MockBandClient::new(), &[]).await;
        let (_packets_tx, packets_rx) = mpsc::channel::<u64>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let handler = h.handler.clone();
            tokio::spawn(async move { handler.handle_new_packet(packets_rx, shutdown_rx).await })
        };

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
