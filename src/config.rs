//! Configuration management for the tunnel relayer
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Chain, gas and gas-source settings are closed tagged unions, so each
//! variant is resolved to its concrete shape when the file is parsed.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid");
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub global: GlobalConfig,
    pub bandchain: BandChainConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub checking_packet_interval_ms: u64,
    pub max_checking_packet_penalty_ms: u64,
    pub penalty_exponential_factor: f64,
    pub sync_tunnels_interval_ms: u64,
    /// Restrict relaying to these tunnels; empty means every tunnel whose
    /// target chain is configured.
    pub tunnel_ids: Vec<u64>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            checking_packet_interval_ms: 60_000,
            max_checking_packet_penalty_ms: 3_600_000,
            penalty_exponential_factor: 1.1,
            sync_tunnels_interval_ms: 300_000,
            tunnel_ids: Vec::new(),
        }
    }
}

impl GlobalConfig {
    pub fn checking_packet_interval(&self) -> Duration {
        Duration::from_millis(self.checking_packet_interval_ms)
    }

    pub fn max_checking_packet_penalty(&self) -> Duration {
        Duration::from_millis(self.max_checking_packet_penalty_ms)
    }

    pub fn sync_tunnels_interval(&self) -> Duration {
        Duration::from_millis(self.sync_tunnels_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BandChainConfig {
    pub rpc_endpoints: Vec<String>,
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
}

impl BandChainConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9184,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "chain_type", rename_all = "lowercase")]
pub enum ChainConfig {
    Evm(EvmChainConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub tunnel_router_address: String,
    /// Environment variable holding the relayer's hex private key
    pub private_key_env: String,
    #[serde(default = "default_block_confirmation")]
    pub block_confirmation: u64,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_waiting_tx_duration_ms")]
    pub waiting_tx_duration_ms: u64,
    #[serde(default = "default_checking_tx_interval_ms")]
    pub checking_tx_interval_ms: u64,
    /// Fixed gas limit; estimated through the RPC when absent
    pub gas_limit: Option<u64>,
    pub gas: GasConfig,
}

impl EvmChainConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn waiting_tx_duration(&self) -> Duration {
        Duration::from_millis(self.waiting_tx_duration_ms)
    }

    pub fn checking_tx_interval(&self) -> Duration {
        Duration::from_millis(self.checking_tx_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GasConfig {
    Legacy {
        #[serde(default)]
        gas_price_sources: Vec<SourceConfig>,
        default_gas_price: u64,
        max_gas_price: Option<u64>,
        #[serde(default = "default_gas_multiplier")]
        multiplier: f64,
        #[serde(default = "default_gas_timeout_ms")]
        timeout_ms: u64,
    },
    Eip1559 {
        #[serde(default)]
        base_fee_sources: Vec<SourceConfig>,
        #[serde(default)]
        priority_fee_sources: Vec<SourceConfig>,
        default_max_base_fee: u64,
        default_max_priority_fee: u64,
        max_base_fee: Option<u64>,
        max_priority_fee: Option<u64>,
        #[serde(default = "default_gas_multiplier")]
        multiplier: f64,
        #[serde(default = "default_gas_timeout_ms")]
        timeout_ms: u64,
    },
}

impl GasConfig {
    /// Factor applied to the fee of a stuck transaction on each retry
    pub fn multiplier(&self) -> f64 {
        match self {
            GasConfig::Legacy { multiplier, .. } | GasConfig::Eip1559 { multiplier, .. } => {
                *multiplier
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            GasConfig::Legacy { timeout_ms, .. } | GasConfig::Eip1559 { timeout_ms, .. } => {
                Duration::from_millis(*timeout_ms)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Query a JSON-RPC node; defaults to the chain's first RPC URL
    Rpc { url: Option<String> },
    Fixed { value: u64 },
}

fn default_query_timeout_ms() -> u64 {
    3_000
}

fn default_block_confirmation() -> u64 {
    5
}

fn default_max_retry() -> u32 {
    3
}

fn default_waiting_tx_duration_ms() -> u64 {
    300_000
}

fn default_checking_tx_interval_ms() -> u64 {
    3_000
}

fn default_gas_multiplier() -> f64 {
    1.1
}

fn default_gas_timeout_ms() -> u64 {
    3_000
}

impl Settings {
    /// Load settings from the file named by `RELAYER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            anyhow::bail!("At least one chain must be configured");
        }

        if self.bandchain.rpc_endpoints.is_empty() {
            anyhow::bail!("At least one BandChain endpoint must be configured");
        }

        let global = &self.global;
        if global.checking_packet_interval_ms == 0 {
            anyhow::bail!("checking_packet_interval_ms must be positive");
        }
        if !global.penalty_exponential_factor.is_finite() || global.penalty_exponential_factor < 1.0
        {
            anyhow::bail!("penalty_exponential_factor must be at least 1.0");
        }
        if global.max_checking_packet_penalty_ms < global.checking_packet_interval_ms {
            anyhow::bail!("max_checking_packet_penalty_ms must not be below the checking interval");
        }

        for (name, chain) in &self.chains {
            match chain {
                ChainConfig::Evm(evm) => {
                    if evm.rpc_urls.is_empty() {
                        anyhow::bail!("Chain {} has no RPC URLs configured", name);
                    }
                    if evm.max_retry == 0 {
                        anyhow::bail!("Chain {} must allow at least one attempt", name);
                    }
                    let multiplier = evm.gas.multiplier();
                    if !multiplier.is_finite() || multiplier < 1.0 {
                        anyhow::bail!("Chain {} gas multiplier must be at least 1.0", name);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
