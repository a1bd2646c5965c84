//! Gas pricing for relay transactions
//!
//! Fee quotes are aggregated from several sources (median), bounded by a
//! timeout and backed by a static default so a quote is always available.

mod datasource;
mod model;
mod sources;

pub use datasource::{DataSources, Source};
pub use model::{Eip1559GasModel, LegacyGasModel};
pub use sources::{FixedSource, RpcQuery, RpcSource};

use crate::config::{GasConfig, SourceConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::metrics::Metrics;

use async_trait::async_trait;
use ethers::types::U256;
use std::sync::Arc;

/// Fixed-point precision used when scaling fees by a float factor
const FACTOR_PRECISION: u64 = 1_000_000;

/// Point-in-time fee quote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gas {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_base_fee: U256,
        max_priority_fee: U256,
    },
}

impl Gas {
    pub fn legacy(gas_price: impl Into<U256>) -> Self {
        Gas::Legacy {
            gas_price: gas_price.into(),
        }
    }

    pub fn eip1559(max_base_fee: impl Into<U256>, max_priority_fee: impl Into<U256>) -> Self {
        Gas::Eip1559 {
            max_base_fee: max_base_fee.into(),
            max_priority_fee: max_priority_fee.into(),
        }
    }

    /// Re-price for a replacement transaction. Only the variable part is
    /// scaled: the gas price for legacy quotes, the priority fee for EIP-1559.
    pub fn bump(&self, factor: f64) -> RelayerResult<Gas> {
        match *self {
            Gas::Legacy { gas_price } => Ok(Gas::Legacy {
                gas_price: scale(gas_price, factor)?,
            }),
            Gas::Eip1559 {
                max_base_fee,
                max_priority_fee,
            } => Ok(Gas::Eip1559 {
                max_base_fee,
                max_priority_fee: scale(max_priority_fee, factor)?,
            }),
        }
    }
}

/// Multiply by `factor`, rounding to the nearest integer
fn scale(value: U256, factor: f64) -> RelayerResult<U256> {
    if !factor.is_finite() || factor < 0.0 {
        return Err(RelayerError::GasEstimation(format!(
            "Invalid bump factor {}",
            factor
        )));
    }

    let scaled_factor = (factor * FACTOR_PRECISION as f64).round();
    if scaled_factor > u64::MAX as f64 {
        return Err(RelayerError::Overflow(format!("bump factor {}", factor)));
    }

    let overflow = || RelayerError::Overflow(format!("{} * {}", value, factor));
    let numerator = value
        .checked_mul(U256::from(scaled_factor as u64))
        .and_then(|n| n.checked_add(U256::from(FACTOR_PRECISION / 2)))
        .ok_or_else(overflow)?;

    Ok(numerator / U256::from(FACTOR_PRECISION))
}

/// Source of fee quotes for one chain
#[async_trait]
pub trait GasModel: Send + Sync {
    /// Current quote; falls back to the configured default on any failure
    async fn get_gas(&self) -> Gas;

    /// Factor applied to a stuck transaction's fee on each retry
    fn bump_multiplier(&self) -> f64;
}

/// Build the gas model described by a chain's gas configuration
pub fn build_gas_model(
    chain: &str,
    config: &GasConfig,
    default_rpc_url: &str,
    metrics: Arc<dyn Metrics>,
) -> RelayerResult<Arc<dyn GasModel>> {
    let model: Arc<dyn GasModel> = match config {
        GasConfig::Legacy {
            gas_price_sources,
            default_gas_price,
            max_gas_price,
            multiplier,
            ..
        } => Arc::new(LegacyGasModel::new(
            chain,
            build_sources(gas_price_sources, RpcQuery::GasPrice, default_rpc_url)?,
            U256::from(*default_gas_price),
            max_gas_price.map(U256::from),
            *multiplier,
            config.timeout(),
            metrics,
        )),
        GasConfig::Eip1559 {
            base_fee_sources,
            priority_fee_sources,
            default_max_base_fee,
            default_max_priority_fee,
            max_base_fee,
            max_priority_fee,
            multiplier,
            ..
        } => Arc::new(Eip1559GasModel::new(
            chain,
            build_sources(base_fee_sources, RpcQuery::BaseFee, default_rpc_url)?,
            build_sources(priority_fee_sources, RpcQuery::PriorityFee, default_rpc_url)?,
            U256::from(*default_max_base_fee),
            U256::from(*default_max_priority_fee),
            max_base_fee.map(U256::from),
            max_priority_fee.map(U256::from),
            *multiplier,
            config.timeout(),
            metrics,
        )),
    };

    Ok(model)
}

fn build_sources(
    configs: &[SourceConfig],
    query: RpcQuery,
    default_rpc_url: &str,
) -> RelayerResult<DataSources> {
    let mut sources: Vec<Arc<dyn Source>> = Vec::with_capacity(configs.len());

    for config in configs {
        let source: Arc<dyn Source> = match config {
            SourceConfig::Rpc { url } => Arc::new(RpcSource::new(
                url.as_deref().unwrap_or(default_rpc_url),
                query,
            )?),
            SourceConfig::Fixed { value } => Arc::new(FixedSource::new(*value)),
        };
        sources.push(source);
    }

    Ok(DataSources::new(sources))
}
