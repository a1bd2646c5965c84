//! EVM chain provider with multi-RPC failover and fee-bumping retries

use super::ChainProvider;
use crate::config::EvmChainConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::gas::{build_gas_model, Gas, GasModel};
use crate::metrics::{Metrics, TxStatus};
use crate::types::{ChainTunnel, Packet, Signing, SigningStatus};

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockId, BlockNumber, Bytes, Eip1559TransactionRequest, TransactionRequest, H256,
    U256, U64,
};
use ethers::utils::id;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

const TUNNEL_INFO_SIGNATURE: &str = "tunnelInfo(uint64,address)";
const RELAY_SIGNATURE: &str = "relay(bytes,address,uint256)";

/// Headroom added on top of `eth_estimateGas`, in percent
const GAS_LIMIT_PADDING_PERCENT: u64 = 20;

/// How far a submitted transaction got before waiting ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Confirmed,
    /// Mined successfully but short of `block_confirmation`
    Mined,
    Pending,
}

pub struct EvmChainProvider {
    /// Configured chain name
    name: String,
    config: EvmChainConfig,
    /// HTTP providers (multiple for failover)
    providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// TunnelRouter contract
    router: Address,
    wallet: LocalWallet,
    gas_model: Arc<dyn GasModel>,
    metrics: Arc<dyn Metrics>,
}

impl EvmChainProvider {
    pub fn new(
        name: &str,
        config: EvmChainConfig,
        metrics: Arc<dyn Metrics>,
    ) -> RelayerResult<Self> {
        let mut providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", name, url);
                }
                Err(e) => warn!("Failed to create provider for {}: {}", url, e),
            }
        }

        let default_rpc_url = config.rpc_urls.first().ok_or_else(|| RelayerError::ChainConnection {
            chain: name.to_string(),
            message: "No RPC URLs configured".to_string(),
        })?;

        if providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain: name.to_string(),
                message: "No valid RPC providers".to_string(),
            });
        }

        let router = parse_address(&config.tunnel_router_address)?;
        let wallet = load_wallet(&config.private_key_env)?.with_chain_id(config.chain_id);
        let gas_model = build_gas_model(name, &config.gas, default_rpc_url, metrics.clone())?;

        info!(
            "Chain {} relays from {:?} through router {:?}",
            name,
            wallet.address(),
            router
        );

        Ok(Self {
            name: name.to_string(),
            config,
            providers,
            current_provider: AtomicUsize::new(0),
            router,
            wallet,
            gas_model,
            metrics,
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.name, next);
    }

    /// Run a read-only request against each provider in turn until one
    /// answers within the query timeout
    async fn call<T, F, Fut>(&self, operation: &str, request: F) -> RelayerResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        for _ in 0..self.providers.len() {
            match timeout(self.config.query_timeout(), request(self.http().clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => warn!("Chain {}: {} failed: {}", self.name, operation, e),
                Err(_) => warn!("Chain {}: {} timed out", self.name, operation),
            }
            self.failover();
        }

        Err(RelayerError::ChainConnection {
            chain: self.name.clone(),
            message: format!("All providers failed to {}", operation),
        })
    }

    async fn gas_limit(&self, data: &Bytes) -> RelayerResult<U256> {
        if let Some(limit) = self.config.gas_limit {
            return Ok(U256::from(limit));
        }

        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(self.router)
            .data(data.clone())
            .into();

        let estimate = self
            .call("estimate gas", |p| {
                let tx = tx.clone();
                async move { p.estimate_gas(&tx, None).await }
            })
            .await?;

        Ok(pad_gas_limit(estimate))
    }

    async fn latest_nonce(&self) -> RelayerResult<U256> {
        let from = self.wallet.address();
        // Latest, not pending: a retry replaces the transaction still in the pool
        self.call("get nonce", move |p| async move {
            p.get_transaction_count(from, Some(BlockId::Number(BlockNumber::Latest)))
                .await
        })
        .await
    }

    async fn submit(&self, tx: &TypedTransaction) -> RelayerResult<H256> {
        let signature = self
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let provider = self.http().clone();
        let send = async move {
            provider
                .send_raw_transaction(raw)
                .await
                .map(|pending| pending.tx_hash())
        };

        match timeout(self.config.query_timeout(), send).await {
            Ok(Ok(tx_hash)) => Ok(tx_hash),
            Ok(Err(e)) => Err(classify_send_error(&self.name, &e.to_string())),
            Err(_) => {
                self.failover();
                Err(RelayerError::Timeout {
                    operation: format!("send transaction on {}", self.name),
                })
            }
        }
    }

    /// Poll until the transaction has `block_confirmation` blocks on top or
    /// `waiting_tx_duration` has passed. A revert is an error.
    async fn wait_for_confirmation(&self, tx_hash: H256) -> RelayerResult<TxState> {
        let deadline = Instant::now() + self.config.waiting_tx_duration();
        let mut state = TxState::Pending;

        loop {
            sleep(self.config.checking_tx_interval()).await;

            let receipt = self
                .call("get transaction receipt", move |p| async move {
                    p.get_transaction_receipt(tx_hash).await
                })
                .await;

            match receipt {
                Ok(Some(receipt)) => {
                    if receipt.status == Some(U64::zero()) {
                        return Err(RelayerError::Contract(format!(
                            "Transaction {:?} reverted on {}",
                            tx_hash, self.name
                        )));
                    }

                    if let Some(mined) = receipt.block_number {
                        state = TxState::Mined;
                        let head = self
                            .call("get block number", |p| async move {
                                p.get_block_number().await
                            })
                            .await;

                        match head {
                            Ok(head) => {
                                let confirmations = head.as_u64().saturating_sub(mined.as_u64());
                                if confirmations >= self.config.block_confirmation {
                                    return Ok(TxState::Confirmed);
                                }
                                debug!(
                                    "Transaction {:?} has {}/{} confirmations",
                                    tx_hash, confirmations, self.config.block_confirmation
                                );
                            }
                            Err(e) => warn!("Failed to read head of {}: {}", self.name, e),
                        }
                    }
                }
                Ok(None) => debug!("Transaction {:?} not mined yet", tx_hash),
                Err(e) => warn!("Failed to check transaction {:?}: {}", tx_hash, e),
            }

            if Instant::now() >= deadline {
                return Ok(state);
            }
        }
    }

    /// Sign and send one relay transaction, then wait on it
    async fn send_relay(
        &self,
        packet: &Packet,
        data: &Bytes,
        gas_limit: U256,
        gas: &Gas,
        attempt: u32,
    ) -> RelayerResult<(H256, TxState)> {
        let nonce = self.latest_nonce().await?;
        let tx = build_transaction(
            self.router,
            data.clone(),
            nonce,
            gas_limit,
            gas,
            self.config.chain_id,
        )?;

        let tx_hash = self.submit(&tx).await?;
        info!(
            "Relaying tunnel {} sequence {} on {}: {:?} (attempt {}/{})",
            packet.tunnel_id,
            packet.sequence,
            self.name,
            tx_hash,
            attempt,
            self.config.max_retry
        );

        let state = self.wait_for_confirmation(tx_hash).await?;
        Ok((tx_hash, state))
    }

    /// Whether the router already holds `packet`; a failed query counts as no
    async fn is_applied(&self, packet: &Packet, tunnel_destination_address: &str) -> bool {
        match self
            .query_tunnel_info(packet.tunnel_id, tunnel_destination_address)
            .await
        {
            Ok(tunnel) => tunnel.latest_sequence >= packet.sequence,
            Err(e) => {
                warn!(
                    "Chain {}: cannot read tunnel {} before retrying: {}",
                    self.name, packet.tunnel_id, e
                );
                false
            }
        }
    }
}

#[async_trait]
impl ChainProvider for EvmChainProvider {
    fn chain_name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> RelayerResult<()> {
        let chain_id = self
            .call("get chain id", |p| async move { p.get_chainid().await })
            .await?;

        if chain_id != U256::from(self.config.chain_id) {
            return Err(RelayerError::Config(format!(
                "Chain {} reports chain ID {}, expected {}",
                self.name, chain_id, self.config.chain_id
            )));
        }

        let address = self.wallet.address();
        let balance = self
            .call("get balance", move |p| async move {
                p.get_balance(address, None).await
            })
            .await?;

        info!(
            "Chain {} initialized, relayer {:?} balance {}",
            self.name, address, balance
        );
        Ok(())
    }

    async fn query_tunnel_info(
        &self,
        tunnel_id: u64,
        tunnel_destination_address: &str,
    ) -> RelayerResult<ChainTunnel> {
        let target = parse_address(tunnel_destination_address)?;
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.router)
            .data(encode_tunnel_info_call(tunnel_id, target))
            .into();

        let output = self
            .call("query tunnel info", |p| {
                let tx = tx.clone();
                async move { p.call(&tx, None).await }
            })
            .await?;

        decode_tunnel_info(&output)
    }

    async fn relay_packet(
        &self,
        packet: &Packet,
        tunnel_destination_address: &str,
    ) -> RelayerResult<()> {
        let signing = packet
            .authoritative_signing()
            .ok_or(RelayerError::MissingSigning {
                tunnel_id: packet.tunnel_id,
                sequence: packet.sequence,
            })?;

        if signing.status != SigningStatus::Success {
            return Err(RelayerError::Transaction(format!(
                "Signing {} of tunnel {} is {}, not relayable",
                signing.id, packet.tunnel_id, signing.status
            )));
        }

        let data = encode_relay_call(signing)?;
        let gas_limit = self.gas_limit(&data).await?;
        let mut gas = self.gas_model.get_gas().await;
        // Once a transaction is mined it is only waited on, never replaced
        let mut mined: Option<H256> = None;
        let mut last_error = None;

        for attempt in 1..=self.config.max_retry {
            if attempt > 1 && self.is_applied(packet, tunnel_destination_address).await {
                info!(
                    "Tunnel {} sequence {} is already applied on {}",
                    packet.tunnel_id, packet.sequence, self.name
                );
                self.metrics.record_tx(&self.name, TxStatus::Success);
                return Ok(());
            }

            let result = match mined {
                Some(tx_hash) => {
                    debug!("Chain {}: still waiting on {:?}", self.name, tx_hash);
                    self.wait_for_confirmation(tx_hash)
                        .await
                        .map(|state| (tx_hash, state))
                }
                None => {
                    self.send_relay(packet, &data, gas_limit, &gas, attempt)
                        .await
                }
            };

            match result {
                Ok((_, TxState::Confirmed)) => {
                    self.metrics.record_tx(&self.name, TxStatus::Success);
                    return Ok(());
                }
                Ok((tx_hash, state)) => {
                    self.metrics.record_tx(&self.name, TxStatus::Timeout);
                    let e = RelayerError::Timeout {
                        operation: format!("confirmation of {:?} on {}", tx_hash, self.name),
                    };
                    warn!("Chain {}: {}", self.name, e);
                    if state == TxState::Mined {
                        mined = Some(tx_hash);
                    }
                    last_error = Some(e);
                }
                Err(e @ RelayerError::Timeout { .. }) => {
                    self.metrics.record_tx(&self.name, TxStatus::Timeout);
                    warn!("Chain {}: {}", self.name, e);
                    last_error = Some(e);
                }
                Err(e @ RelayerError::InsufficientBalance { .. })
                | Err(e @ RelayerError::Contract(_)) => {
                    self.metrics.record_tx(&self.name, TxStatus::Failed);
                    return Err(e);
                }
                Err(e) => {
                    self.metrics.record_tx(&self.name, TxStatus::Failed);
                    warn!("Chain {}: {}", self.name, e);
                    last_error = Some(e);
                }
            }

            if attempt < self.config.max_retry && mined.is_none() {
                gas = gas.bump(self.gas_model.bump_multiplier())?;
                debug!("Chain {}: retrying with {:?}", self.name, gas);
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RelayerError::Transaction(format!(
                "Failed to relay tunnel {} sequence {}",
                packet.tunnel_id, packet.sequence
            ))
        }))
    }
}

/// Read the relayer key from the named environment variable
fn load_wallet(env_var: &str) -> RelayerResult<LocalWallet> {
    let key = std::env::var(env_var)
        .map_err(|_| RelayerError::Wallet(format!("Environment variable {} is not set", env_var)))?;

    key.trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
}

fn parse_address(address: &str) -> RelayerResult<Address> {
    address
        .parse()
        .map_err(|e| RelayerError::Config(format!("Invalid address {}: {}", address, e)))
}

fn pad_gas_limit(estimate: U256) -> U256 {
    estimate.saturating_mul(U256::from(100 + GAS_LIMIT_PADDING_PERCENT)) / U256::from(100u64)
}

fn encode_tunnel_info_call(tunnel_id: u64, target: Address) -> Bytes {
    let mut data = id(TUNNEL_INFO_SIGNATURE).to_vec();
    data.extend(abi::encode(&[
        Token::Uint(U256::from(tunnel_id)),
        Token::Address(target),
    ]));
    data.into()
}

fn decode_tunnel_info(output: &[u8]) -> RelayerResult<ChainTunnel> {
    let tokens = abi::decode(
        &[ParamType::Bool, ParamType::Uint(64), ParamType::Uint(256)],
        output,
    )
    .map_err(|e| RelayerError::Contract(format!("Malformed tunnelInfo output: {}", e)))?;

    match tokens.as_slice() {
        [Token::Bool(is_active), Token::Uint(sequence), Token::Uint(balance)] => {
            if *sequence > U256::from(u64::MAX) {
                return Err(RelayerError::Overflow(format!("sequence {}", sequence)));
            }
            Ok(ChainTunnel {
                latest_sequence: sequence.as_u64(),
                is_active: *is_active,
                balance: *balance,
            })
        }
        _ => Err(RelayerError::Contract(
            "Unexpected tunnelInfo output layout".to_string(),
        )),
    }
}

fn encode_relay_call(signing: &Signing) -> RelayerResult<Bytes> {
    let evm_signature = signing.evm_signature.as_ref().ok_or_else(|| {
        RelayerError::Contract(format!("Signing {} has no EVM signature", signing.id))
    })?;

    if evm_signature.r_address.len() != 20 {
        return Err(RelayerError::Contract(format!(
            "Signing {} has a {}-byte r_address",
            signing.id,
            evm_signature.r_address.len()
        )));
    }
    if evm_signature.signature.len() != 32 {
        return Err(RelayerError::Contract(format!(
            "Signing {} has a {}-byte signature",
            signing.id,
            evm_signature.signature.len()
        )));
    }

    let mut data = id(RELAY_SIGNATURE).to_vec();
    data.extend(abi::encode(&[
        Token::Bytes(signing.message.clone()),
        Token::Address(Address::from_slice(&evm_signature.r_address)),
        Token::Uint(U256::from_big_endian(&evm_signature.signature)),
    ]));
    Ok(data.into())
}

fn build_transaction(
    to: Address,
    data: Bytes,
    nonce: U256,
    gas_limit: U256,
    gas: &Gas,
    chain_id: u64,
) -> RelayerResult<TypedTransaction> {
    let tx: TypedTransaction = match *gas {
        Gas::Legacy { gas_price } => TransactionRequest::new()
            .to(to)
            .data(data)
            .nonce(nonce)
            .gas(gas_limit)
            .gas_price(gas_price)
            .chain_id(chain_id)
            .into(),
        Gas::Eip1559 {
            max_base_fee,
            max_priority_fee,
        } => {
            let max_fee = max_base_fee.checked_add(max_priority_fee).ok_or_else(|| {
                RelayerError::Overflow(format!("{} + {}", max_base_fee, max_priority_fee))
            })?;

            TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .to(to)
                    .data(data)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(max_fee)
                    .max_priority_fee_per_gas(max_priority_fee)
                    .chain_id(chain_id),
            )
        }
    };

    Ok(tx)
}

fn classify_send_error(chain: &str, message: &str) -> RelayerError {
    if message.contains("insufficient funds") {
        return RelayerError::InsufficientBalance {
            chain: chain.to_string(),
            message: message.to_string(),
        };
    }

    if message.contains("replacement transaction underpriced") {
        warn!("Chain {}: replacement underpriced, bumping gas", chain);
    } else if message.contains("nonce too low") {
        warn!("Chain {}: nonce too low, previous attempt may have landed", chain);
    }

    RelayerError::Transaction(message.to_string())
}
