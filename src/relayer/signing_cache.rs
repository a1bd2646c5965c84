//! Self-expiring map of pending signings

use crate::metrics::Metrics;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// How long a pending signing is remembered
pub const SIGNING_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub tunnel_id: u64,
    pub signing_id: u64,
}

#[derive(Debug)]
struct TimedEntry {
    entry: CacheEntry,
    expires_at: Instant,
}

/// Signing ID -> tunnel mapping with per-entry expiry.
///
/// Every entry that leaves the map, whether removed or expired, is reported
/// to the pending-signing gauge exactly once.
pub struct SigningCache {
    entries: DashMap<u64, TimedEntry>,
    ttl: Duration,
    metrics: Arc<dyn Metrics>,
}

impl SigningCache {
    pub fn new(ttl: Duration, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            metrics,
        }
    }

    pub fn insert(&self, entry: CacheEntry) {
        let timed = TimedEntry {
            entry,
            expires_at: Instant::now() + self.ttl,
        };

        if self.entries.insert(entry.signing_id, timed).is_none() {
            self.metrics.record_pending_signing_added();
        }
    }

    /// Take the entry for `signing_id`; expired entries are dropped and
    /// reported as a miss
    pub fn remove(&self, signing_id: u64) -> Option<CacheEntry> {
        let (_, timed) = self.entries.remove(&signing_id)?;
        self.metrics.record_pending_signings_removed(1);

        if timed.expires_at <= Instant::now() {
            debug!("Signing {} expired before its result arrived", signing_id);
            return None;
        }
        Some(timed.entry)
    }

    /// Drop every expired entry, returning how many were dropped
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0usize;

        self.entries.retain(|_, timed| {
            let live = timed.expires_at > now;
            if !live {
                evicted += 1;
            }
            live
        });

        if evicted > 0 {
            self.metrics.record_pending_signings_removed(evicted as u64);
            debug!(
                "Evicted {} expired signings, {} still pending",
                evicted,
                self.len()
            );
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep expired entries every `period` until shutdown
    pub async fn run_eviction(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if !self.is_empty() {
                        self.evict_expired();
                    }
                }
            }
        }

        info!("Signing cache sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PrometheusMetrics;

    fn cache(ttl: Duration) -> (SigningCache, Arc<PrometheusMetrics>) {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        (SigningCache::new(ttl, metrics.clone()), metrics)
    }

    fn entry(tunnel_id: u64, signing_id: u64) -> CacheEntry {
        CacheEntry {
            tunnel_id,
            signing_id,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_returns_entry_once() {
        let (cache, metrics) = cache(SIGNING_CACHE_TTL);
        cache.insert(entry(1, 42));
        assert_eq!(metrics.pending_signings(), 1);

        assert_eq!(cache.remove(42), Some(entry(1, 42)));
        assert_eq!(cache.remove(42), None);
        assert_eq!(metrics.pending_signings(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinsert_does_not_double_count() {
        let (cache, metrics) = cache(SIGNING_CACHE_TTL);
        cache.insert(entry(1, 42));
        cache.insert(entry(1, 42));

        assert_eq!(cache.len(), 1);
        assert_eq!(metrics.pending_signings(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss() {
        let (cache, metrics) = cache(Duration::from_secs(60));
        cache.insert(entry(1, 42));

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(cache.remove(42), None);
        assert_eq!(metrics.pending_signings(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_keeps_live_entries() {
        let (cache, metrics) = cache(Duration::from_secs(60));
        cache.insert(entry(1, 1));
        cache.insert(entry(1, 2));
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.insert(entry(2, 3));
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(cache.evict_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(metrics.pending_signings(), 1);
        assert_eq!(cache.remove(3), Some(entry(2, 3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_and_stops() {
        let (cache, metrics) = cache(Duration::from_secs(60));
        let cache = Arc::new(cache);
        cache.insert(entry(1, 1));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .run_eviction(Duration::from_secs(10), shutdown_rx)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(cache.is_empty());
        assert_eq!(metrics.pending_signings(), 0);

        shutdown_tx.send(true).unwrap();
        sweeper.await.unwrap();
    }
}
