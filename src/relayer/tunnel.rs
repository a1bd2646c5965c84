//! Per-tunnel check-and-relay state machine

use crate::band::BandClient;
use crate::chain::ChainProvider;
use crate::error::{RelayerError, RelayerResult};
use crate::metrics::{CheckOutcome, Metrics};
use crate::types::{SigningStatus, Tunnel};

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Relays the packets of one tunnel, in sequence order
pub struct TunnelRelayer {
    tunnel_id: u64,
    target_chain: String,
    /// Destination contract on the target chain
    target_address: String,
    band_client: Arc<dyn BandClient>,
    chain_provider: Arc<dyn ChainProvider>,
    metrics: Arc<dyn Metrics>,
    is_executing: AtomicBool,
}

/// Clears the executing flag however the check ends
struct ExecutingGuard<'a>(&'a AtomicBool);

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TunnelRelayer {
    pub fn new(
        tunnel_id: u64,
        target_chain: &str,
        target_address: &str,
        band_client: Arc<dyn BandClient>,
        chain_provider: Arc<dyn ChainProvider>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            tunnel_id,
            target_chain: target_chain.to_string(),
            target_address: target_address.to_string(),
            band_client,
            chain_provider,
            metrics,
            is_executing: AtomicBool::new(false),
        }
    }

    pub fn tunnel_id(&self) -> u64 {
        self.tunnel_id
    }

    pub fn is_executing(&self) -> bool {
        self.is_executing.load(Ordering::Acquire)
    }

    /// Relay every packet the target chain is missing, stopping at the first
    /// one that is not ready yet.
    ///
    /// Returns `Ok(())` without doing anything if a check for this tunnel is
    /// already running. A panic during the check is returned as
    /// [`RelayerError::Panic`].
    pub async fn check_and_relay(&self) -> RelayerResult<()> {
        if self
            .is_executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Tunnel {} is already being checked", self.tunnel_id);
            return Ok(());
        }
        let _guard = ExecutingGuard(&self.is_executing);

        let started = Instant::now();
        let result = match AssertUnwindSafe(self.relay_pending_packets())
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(RelayerError::Panic(panic_message(panic))),
        };

        let outcome = if result.is_ok() {
            CheckOutcome::Success
        } else {
            CheckOutcome::Failure
        };
        self.metrics
            .record_tunnel_check(self.tunnel_id, outcome, started.elapsed());

        result
    }

    async fn relay_pending_packets(&self) -> RelayerResult<()> {
        let mut last_relayed = None;

        loop {
            let tunnel = self.fetch_tunnel().await?;
            debug!(
                "Tunnel {}: BandChain sequence {}, {} sequence {}, balance {}",
                self.tunnel_id,
                tunnel.band.latest_sequence,
                self.target_chain,
                tunnel.chain.latest_sequence,
                tunnel.chain.balance
            );

            if !tunnel.chain.is_active {
                debug!(
                    "Tunnel {} is inactive on {}, skipping",
                    self.tunnel_id, self.target_chain
                );
                return Ok(());
            }

            if let Some(sequence) = last_relayed {
                if tunnel.chain.latest_sequence < sequence {
                    return Err(RelayerError::SequenceNotAdvanced {
                        tunnel_id: self.tunnel_id,
                        sequence,
                    });
                }
            }

            if !tunnel.has_pending_packet() {
                debug!(
                    "Tunnel {} is up to date at sequence {}",
                    self.tunnel_id, tunnel.chain.latest_sequence
                );
                return Ok(());
            }

            let sequence = tunnel.next_sequence();
            let packet = self
                .band_client
                .get_tunnel_packet(self.tunnel_id, sequence)
                .await?;

            let signing =
                packet
                    .authoritative_signing()
                    .ok_or(RelayerError::MissingSigning {
                        tunnel_id: self.tunnel_id,
                        sequence,
                    })?;

            match signing.status {
                SigningStatus::Success => {}
                SigningStatus::Waiting => {
                    debug!(
                        "Tunnel {} sequence {} is waiting for signing {}",
                        self.tunnel_id, sequence, signing.id
                    );
                    return Ok(());
                }
                SigningStatus::Fallen => {
                    return Err(RelayerError::SigningFallen {
                        tunnel_id: self.tunnel_id,
                        sequence,
                        signing_id: signing.id,
                    });
                }
                SigningStatus::Unspecified => {
                    return Err(RelayerError::SigningUnspecified {
                        tunnel_id: self.tunnel_id,
                        sequence,
                        signing_id: signing.id,
                    });
                }
            }

            self.chain_provider
                .relay_packet(&packet, &self.target_address)
                .await?;
            self.metrics
                .record_packet_relayed(self.tunnel_id, &self.target_chain);
            info!(
                "Relayed tunnel {} sequence {} ({} prices) to {}",
                self.tunnel_id,
                sequence,
                packet.signal_prices.len(),
                self.target_chain
            );

            last_relayed = Some(sequence);
        }
    }

    async fn fetch_tunnel(&self) -> RelayerResult<Tunnel> {
        let (band, chain) = tokio::try_join!(
            self.band_client.get_tunnel(self.tunnel_id),
            self.chain_provider
                .query_tunnel_info(self.tunnel_id, &self.target_address),
        )?;

        Ok(Tunnel { band, chain })
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::band::MockBandClient;
    use crate::metrics::PrometheusMetrics;
    use crate::test_utils::{
        band_tunnel, packet, signed_packet, signing, FakeChain, TEST_ADDRESS, TEST_CHAIN,
    };
    use std::time::Duration;

    fn band_at(latest_sequence: u64, status: SigningStatus) -> MockBandClient {
        let mut band = MockBandClient::new();
        band.expect_get_tunnel()
            .returning(move |id| Ok(band_tunnel(id, latest_sequence)));
        band.expect_get_tunnel_packet()
            .returning(move |id, sequence| Ok(signed_packet(id, sequence, status)));
        band
    }

    fn relayer(
        band: MockBandClient,
        chain: Arc<FakeChain>,
        metrics: Arc<PrometheusMetrics>,
    ) -> TunnelRelayer {
        TunnelRelayer::new(1, TEST_CHAIN, TEST_ADDRESS, Arc::new(band), chain, metrics)
    }

    #[tokio::test]
    async fn test_inactive_tunnel_is_a_noop() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let chain = Arc::new(FakeChain::new(0).inactive());
        let mut band = MockBandClient::new();
        band.expect_get_tunnel()
            .returning(|id| Ok(band_tunnel(id, 3)));
        band.expect_get_tunnel_packet().never();

        let relayer = relayer(band, chain.clone(), metrics.clone());
        relayer.check_and_relay().await.unwrap();

        assert!(chain.relayed().is_empty());
        assert_eq!(metrics.tunnel_checks(1, CheckOutcome::Success), 1);
    }

    #[tokio::test]
    async fn test_relays_backlog_in_order() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let chain = Arc::new(FakeChain::new(2));

        let relayer = relayer(band_at(5, SigningStatus::Success), chain.clone(), metrics);
        relayer.check_and_relay().await.unwrap();

        assert_eq!(chain.relayed(), vec![3, 4, 5]);
        assert!(!relayer.is_executing());
    }

    #[tokio::test]
    async fn test_up_to_date_tunnel_does_not_fetch_packets() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let chain = Arc::new(FakeChain::new(4));
        let mut band = MockBandClient::new();
        band.expect_get_tunnel()
            .returning(|id| Ok(band_tunnel(id, 4)));
        band.expect_get_tunnel_packet().never();

        relayer(band, chain.clone(), metrics)
            .check_and_relay()
            .await
            .unwrap();
        assert!(chain.relayed().is_empty());
    }

    #[tokio::test]
    async fn test_waiting_signing_returns_ok_without_relay() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let chain = Arc::new(FakeChain::new(0));

        let relayer = relayer(band_at(1, SigningStatus::Waiting), chain.clone(), metrics);
        relayer.check_and_relay().await.unwrap();

        assert!(chain.relayed().is_empty());
    }

    #[tokio::test]
    async fn test_fallen_and_unspecified_signings_are_errors() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let chain = Arc::new(FakeChain::new(0));

        let fallen = relayer(band_at(1, SigningStatus::Fallen), chain.clone(), metrics.clone());
        assert!(matches!(
            fallen.check_and_relay().await,
            Err(RelayerError::SigningFallen { sequence: 1, .. })
        ));

        let unspecified = relayer(band_at(1, SigningStatus::Unspecified), chain.clone(), metrics.clone());
        assert!(matches!(
            unspecified.check_and_relay().await,
            Err(RelayerError::SigningUnspecified { sequence: 1, .. })
        ));

        assert!(chain.relayed().is_empty());
        assert_eq!(metrics.tunnel_checks(1, CheckOutcome::Failure), 2);
    }

    #[tokio::test]
    async fn test_incoming_group_signing_used_when_current_missing() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let chain = Arc::new(FakeChain::new(0));
        let mut band = MockBandClient::new();
        band.expect_get_tunnel()
            .returning(|id| Ok(band_tunnel(id, 1)));
        band.expect_get_tunnel_packet().returning(|id, sequence| {
            Ok(packet(id, sequence, None, Some(signing(7, SigningStatus::Success))))
        });

        relayer(band, chain.clone(), metrics)
            .check_and_relay()
            .await
            .unwrap();
        assert_eq!(chain.relayed(), vec![1]);
    }

    #[tokio::test]
    async fn test_packet_without_signing_is_an_error() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let chain = Arc::new(FakeChain::new(0));
        let mut band = MockBandClient::new();
        band.expect_get_tunnel()
            .returning(|id| Ok(band_tunnel(id, 1)));
        band.expect_get_tunnel_packet()
            .returning(|id, sequence| Ok(packet(id, sequence, None, None)));

        let result = relayer(band, chain, metrics).check_and_relay().await;
        assert!(matches!(
            result,
            Err(RelayerError::MissingSigning { sequence: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_sequence_not_advancing_stops_the_loop() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let chain = Arc::new(FakeChain::new(0).stuck());

        let relayer = relayer(band_at(3, SigningStatus::Success), chain.clone(), metrics);
        let result = relayer.check_and_relay().await;

        assert!(matches!(
            result,
            Err(RelayerError::SequenceNotAdvanced { sequence: 1, .. })
        ));
        assert_eq!(chain.relayed(), vec![1]);
    }

    #[tokio::test]
    async fn test_relay_failure_is_propagated() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let chain = Arc::new(FakeChain::new(0).failing_relay());

        let relayer = relayer(band_at(1, SigningStatus::Success), chain, metrics);
        assert!(matches!(
            relayer.check_and_relay().await,
            Err(RelayerError::Transaction(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_check_is_skipped() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let chain = Arc::new(FakeChain::new(0).with_query_delay(Duration::from_secs(1)));

        let relayer = relayer(band_at(0, SigningStatus::Success), chain.clone(), metrics);
        let (first, second) = tokio::join!(relayer.check_and_relay(), relayer.check_and_relay());

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(chain.queries(), 1);
        assert!(!relayer.is_executing());
    }

    #[tokio::test]
    async fn test_panic_is_recovered_as_error() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let chain = Arc::new(FakeChain::new(0).panicking_relay());

        let relayer = relayer(band_at(1, SigningStatus::Success), chain, metrics);
        let result = relayer.check_and_relay().await;

        match result {
            Err(RelayerError::Panic(message)) => {
                assert!(message.contains("router exploded at sequence 1"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!relayer.is_executing());
    }
}
