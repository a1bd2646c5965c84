//! Concrete fee sources

use super::Source;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{BlockNumber, U256};

/// Figure an RPC source asks its node for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcQuery {
    /// `eth_gasPrice`
    GasPrice,
    /// `eth_maxPriorityFeePerGas`
    PriorityFee,
    /// Base fee of the latest block
    BaseFee,
}

/// Fee source backed by an EVM JSON-RPC node
pub struct RpcSource {
    name: String,
    provider: Provider<Http>,
    query: RpcQuery,
}

impl RpcSource {
    pub fn new(url: &str, query: RpcQuery) -> RelayerResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| RelayerError::Config(format!("Invalid gas source URL {}: {}", url, e)))?;

        Ok(Self {
            name: format!("rpc:{}", url),
            provider,
            query,
        })
    }

    async fn query(&self) -> RelayerResult<U256> {
        let gas_err = |e: ethers::providers::ProviderError| {
            RelayerError::GasEstimation(format!("{}: {}", self.name, e))
        };

        match self.query {
            RpcQuery::GasPrice => self.provider.get_gas_price().await.map_err(gas_err),
            RpcQuery::PriorityFee => self
                .provider
                .request::<_, U256>("eth_maxPriorityFeePerGas", ())
                .await
                .map_err(gas_err),
            RpcQuery::BaseFee => {
                let block = self
                    .provider
                    .get_block(BlockNumber::Latest)
                    .await
                    .map_err(gas_err)?
                    .ok_or_else(|| {
                        RelayerError::GasEstimation(format!("{}: latest block missing", self.name))
                    })?;

                block.base_fee_per_gas.ok_or_else(|| {
                    RelayerError::GasEstimation(format!("{}: block has no base fee", self.name))
                })
            }
        }
    }
}

#[async_trait]
impl Source for RpcSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_data(&self) -> RelayerResult<u64> {
        let value = self.query().await?;
        to_u64(value)
    }
}

fn to_u64(value: U256) -> RelayerResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(RelayerError::Overflow(format!("fee {} exceeds u64", value)));
    }
    Ok(value.as_u64())
}

/// Source that always answers with the same figure
pub struct FixedSource {
    name: String,
    value: u64,
}

impl FixedSource {
    pub fn new(value: u64) -> Self {
        Self {
            name: format!("fixed:{}", value),
            value,
        }
    }
}

#[async_trait]
impl Source for FixedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_data(&self) -> RelayerResult<u64> {
        Ok(self.value)
    }
}
