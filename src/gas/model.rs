//! Legacy and EIP-1559 gas models

use super::{DataSources, Gas, GasModel};
use crate::metrics::Metrics;

use async_trait::async_trait;
use ethers::types::U256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Median of `sources` within `limit`, or `default` if that is not possible
async fn quote_or_default(
    chain: &str,
    label: &str,
    sources: &DataSources,
    limit: Duration,
    default: U256,
    metrics: &dyn Metrics,
) -> U256 {
    if sources.is_empty() {
        return default;
    }

    match timeout(limit, sources.get_data()).await {
        Ok(Ok(value)) => U256::from(value),
        Ok(Err(e)) => {
            warn!(
                "Chain {}: {} estimation failed, using default {}: {}",
                chain, label, default, e
            );
            metrics.record_gas_fallback(chain);
            default
        }
        Err(_) => {
            warn!(
                "Chain {}: {} estimation timed out after {:?}, using default {}",
                chain, label, limit, default
            );
            metrics.record_gas_fallback(chain);
            default
        }
    }
}

fn cap(value: U256, max: Option<U256>) -> U256 {
    match max {
        Some(max) => value.min(max),
        None => value,
    }
}

/// Gas model for chains using a single gas price
pub struct LegacyGasModel {
    chain: String,
    sources: DataSources,
    default_gas_price: U256,
    max_gas_price: Option<U256>,
    multiplier: f64,
    timeout: Duration,
    metrics: Arc<dyn Metrics>,
}

impl LegacyGasModel {
    pub fn new(
        chain: &str,
        sources: DataSources,
        default_gas_price: U256,
        max_gas_price: Option<U256>,
        multiplier: f64,
        timeout: Duration,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            sources,
            default_gas_price,
            max_gas_price,
            multiplier,
            timeout,
            metrics,
        }
    }
}

#[async_trait]
impl GasModel for LegacyGasModel {
    async fn get_gas(&self) -> Gas {
        let gas_price = quote_or_default(
            &self.chain,
            "gas price",
            &self.sources,
            self.timeout,
            self.default_gas_price,
            self.metrics.as_ref(),
        )
        .await;

        let gas = Gas::legacy(cap(gas_price, self.max_gas_price));
        debug!("Gas price for chain {}: {:?}", self.chain, gas);
        gas
    }

    fn bump_multiplier(&self) -> f64 {
        self.multiplier
    }
}

/// Gas model for chains with a base fee market
pub struct Eip1559GasModel {
    chain: String,
    base_fee_sources: DataSources,
    priority_fee_sources: DataSources,
    default_max_base_fee: U256,
    default_max_priority_fee: U256,
    max_base_fee: Option<U256>,
    max_priority_fee: Option<U256>,
    multiplier: f64,
    timeout: Duration,
    metrics: Arc<dyn Metrics>,
}

impl Eip1559GasModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: &str,
        base_fee_sources: DataSources,
        priority_fee_sources: DataSources,
        default_max_base_fee: U256,
        default_max_priority_fee: U256,
        max_base_fee: Option<U256>,
        max_priority_fee: Option<U256>,
        multiplier: f64,
        timeout: Duration,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            base_fee_sources,
            priority_fee_sources,
            default_max_base_fee,
            default_max_priority_fee,
            max_base_fee,
            max_priority_fee,
            multiplier,
            timeout,
            metrics,
        }
    }
}

#[async_trait]
impl GasModel for Eip1559GasModel {
    async fn get_gas(&self) -> Gas {
        let (base_fee, priority_fee) = tokio::join!(
            quote_or_default(
                &self.chain,
                "base fee",
                &self.base_fee_sources,
                self.timeout,
                self.default_max_base_fee,
                self.metrics.as_ref(),
            ),
            quote_or_default(
                &self.chain,
                "priority fee",
                &self.priority_fee_sources,
                self.timeout,
                self.default_max_priority_fee,
                self.metrics.as_ref(),
            ),
        );

        let gas = Gas::eip1559(
            cap(base_fee, self.max_base_fee),
            cap(priority_fee, self.max_priority_fee),
        );
        debug!("Gas fees for chain {}: {:?}", self.chain, gas);
        gas
    }

    fn bump_multiplier(&self) -> f64 {
        self.multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PrometheusMetrics;
    use crate::test_utils::FakeSource;

    fn sources(list: Vec<FakeSource>) -> DataSources {
        DataSources::new(
            list.into_iter()
                .map(|s| Arc::new(s) as Arc<dyn crate::gas::Source>)
                .collect(),
        )
    }

    fn legacy(sources: DataSources, max: Option<u64>, metrics: Arc<PrometheusMetrics>) -> LegacyGasModel {
        LegacyGasModel::new(
            "eth",
            sources,
            U256::from(42u64),
            max.map(U256::from),
            1.1,
            Duration::from_secs(1),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_legacy_uses_median_of_sources() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let model = legacy(
            sources(vec![
                FakeSource::value("a", 10),
                FakeSource::value("b", 30),
                FakeSource::failing("c"),
            ]),
            None,
            metrics.clone(),
        );

        assert_eq!(model.get_gas().await, Gas::legacy(20u64));
        assert_eq!(metrics.gas_fallbacks("eth"), 0);
    }

    #[tokio::test]
    async fn test_legacy_falls_back_when_all_sources_fail() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let model = legacy(sources(vec![FakeSource::failing("a")]), None, metrics.clone());

        assert_eq!(model.get_gas().await, Gas::legacy(42u64));
        assert_eq!(metrics.gas_fallbacks("eth"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_falls_back_on_timeout() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let model = legacy(
            sources(vec![FakeSource::value("slow", 99).with_delay(Duration::from_secs(30))]),
            None,
            metrics.clone(),
        );

        assert_eq!(model.get_gas().await, Gas::legacy(42u64));
        assert_eq!(metrics.gas_fallbacks("eth"), 1);
    }

    #[tokio::test]
    async fn test_legacy_caps_gas_price() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let model = legacy(sources(vec![FakeSource::value("a", 500)]), Some(100), metrics);

        assert_eq!(model.get_gas().await, Gas::legacy(100u64));
    }

    #[tokio::test]
    async fn test_eip1559_quotes_both_fees() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let model = Eip1559GasModel::new(
            "base",
            sources(vec![FakeSource::value("base", 60)]),
            sources(vec![FakeSource::failing("tip")]),
            U256::from(50u64),
            U256::from(2u64),
            None,
            None,
            1.2,
            Duration::from_secs(1),
            metrics.clone(),
        );

        assert_eq!(model.get_gas().await, Gas::eip1559(60u64, 2u64));
        assert_eq!(metrics.gas_fallbacks("base"), 1);
        assert_eq!(model.bump_multiplier(), 1.2);
    }
}
