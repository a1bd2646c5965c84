//! Target chain access
//!
//! This module provides:
//! - The `ChainProvider` trait the relay engine submits packets through
//! - An EVM implementation with multi-RPC failover and fee-bumping retries

pub mod evm;

pub use evm::EvmChainProvider;

use crate::config::{ChainConfig, Settings};
use crate::error::RelayerResult;
use crate::metrics::Metrics;
use crate::types::{ChainTunnel, Packet};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Read/write access to the tunnel router on one target chain
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Configured name of the chain
    fn chain_name(&self) -> &str;

    /// Connect and verify the chain before relaying
    async fn init(&self) -> RelayerResult<()>;

    /// Tunnel state as seen by the target chain's router contract
    async fn query_tunnel_info(
        &self,
        tunnel_id: u64,
        tunnel_destination_address: &str,
    ) -> RelayerResult<ChainTunnel>;

    /// Submit a fully signed packet and wait for it to be confirmed
    async fn relay_packet(
        &self,
        packet: &Packet,
        tunnel_destination_address: &str,
    ) -> RelayerResult<()>;
}

/// Build a provider for every configured chain, keyed by chain name
pub fn build_chain_providers(
    settings: &Settings,
    metrics: Arc<dyn Metrics>,
) -> RelayerResult<HashMap<String, Arc<dyn ChainProvider>>> {
    let mut providers: HashMap<String, Arc<dyn ChainProvider>> = HashMap::new();

    for (name, chain_config) in &settings.chains {
        let provider: Arc<dyn ChainProvider> = match chain_config {
            ChainConfig::Evm(config) => {
                info!("Configuring EVM chain {} (ID: {})", name, config.chain_id);
                Arc::new(EvmChainProvider::new(name, config.clone(), metrics.clone())?)
            }
        };
        providers.insert(name.clone(), provider);
    }

    Ok(providers)
}
