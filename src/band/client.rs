//! BandChain LCD REST client with endpoint failover

use super::BandClient;
use crate::config::BandChainConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::types::{BandTunnel, EvmSignature, Packet, SignalPrice, Signing, SigningStatus};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

const TUNNEL_PATH: &str = "/band/tunnel/v1beta1/tunnels";
const SIGNING_PATH: &str = "/band/bandtss/v1beta1/signings";

/// REST client over one or more BandChain LCD endpoints
pub struct RestBandClient {
    client: Client,
    endpoints: Vec<String>,
    /// Current active endpoint index
    current_endpoint: AtomicUsize,
}

impl RestBandClient {
    pub fn new(config: &BandChainConfig) -> RelayerResult<Self> {
        if config.rpc_endpoints.is_empty() {
            return Err(RelayerError::Config(
                "No BandChain endpoints configured".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RelayerError::Config(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints: config
                .rpc_endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            current_endpoint: AtomicUsize::new(0),
        })
    }

    fn endpoint(&self) -> &str {
        let idx = self.current_endpoint.load(Ordering::Relaxed);
        &self.endpoints[idx % self.endpoints.len()]
    }

    /// Switch to next available endpoint
    fn failover(&self) {
        let current = self.current_endpoint.load(Ordering::Relaxed);
        let next = (current + 1) % self.endpoints.len();
        self.current_endpoint.store(next, Ordering::Relaxed);
        warn!("BandChain client failover to endpoint {}", self.endpoint());
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> RelayerResult<T> {
        let mut last_error = None;

        for _ in 0..self.endpoints.len() {
            let url = format!("{}{}", self.endpoint(), path);
            match self.fetch(&url, query).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("BandChain query {} failed: {}", url, e);
                    last_error = Some(e);
                    self.failover();
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RelayerError::BandQuery("All endpoints failed".to_string())))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> RelayerResult<T> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| RelayerError::BandQuery(e.to_string()))?
            .error_for_status()
            .map_err(|e| RelayerError::BandQuery(e.to_string()))?;

        response
            .json::<T>()
            .await
            .map_err(|e| RelayerError::BandQuery(format!("Invalid response from {}: {}", url, e)))
    }

    async fn get_signing(&self, signing_id: u64) -> RelayerResult<SigningResponse> {
        self.get_json(&format!("{}/{}", SIGNING_PATH, signing_id), &[])
            .await
    }
}

#[async_trait]
impl BandClient for RestBandClient {
    async fn get_tunnel(&self, tunnel_id: u64) -> RelayerResult<BandTunnel> {
        let response: TunnelResponse = self
            .get_json(&format!("{}/{}", TUNNEL_PATH, tunnel_id), &[])
            .await?;
        Ok(response.tunnel.into())
    }

    async fn get_tunnel_packet(&self, tunnel_id: u64, sequence: u64) -> RelayerResult<Packet> {
        let response: PacketResponse = self
            .get_json(
                &format!("{}/{}/packets/{}", TUNNEL_PATH, tunnel_id, sequence),
                &[],
            )
            .await?;
        let packet = response.packet;

        let signing_id = packet.receipt.map(|r| r.signing_id).unwrap_or_default();
        let (current_group_signing, incoming_group_signing) = if signing_id == 0 {
            debug!(
                "Packet {} of tunnel {} has no signing receipt",
                sequence, tunnel_id
            );
            (None, None)
        } else {
            let signing = self.get_signing(signing_id).await?;
            (
                signing.current_group_signing_result.map(Signing::from),
                signing.incoming_group_signing_result.map(Signing::from),
            )
        };

        Ok(Packet {
            tunnel_id: packet.tunnel_id,
            sequence: packet.sequence,
            signal_prices: packet
                .prices
                .into_iter()
                .map(|p| SignalPrice {
                    signal_id: p.signal_id,
                    price: p.price,
                })
                .collect(),
            current_group_signing,
            incoming_group_signing,
        })
    }

    async fn get_tunnels(&self) -> RelayerResult<Vec<BandTunnel>> {
        let mut tunnels = Vec::new();
        let mut next_key: Option<String> = None;

        loop {
            let query: Vec<(&str, String)> = next_key
                .take()
                .map(|key| vec![("pagination.key", key)])
                .unwrap_or_default();

            let page: TunnelsResponse = self.get_json(TUNNEL_PATH, &query).await?;
            tunnels.extend(page.tunnels.into_iter().map(BandTunnel::from));

            match page.pagination.and_then(|p| p.next_key) {
                Some(key) if !key.is_empty() => next_key = Some(key),
                _ => break,
            }
        }

        debug!("Fetched {} tunnels from BandChain", tunnels.len());
        Ok(tunnels)
    }
}

// Response shapes of the LCD API. 64-bit integers arrive as decimal strings
// and bytes as base64.

#[derive(Debug, Deserialize)]
struct TunnelResponse {
    tunnel: TunnelDto,
}

#[derive(Debug, Deserialize)]
struct TunnelsResponse {
    #[serde(default)]
    tunnels: Vec<TunnelDto>,
    pagination: Option<PageResponse>,
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    next_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TunnelDto {
    #[serde(deserialize_with = "de_u64")]
    id: u64,
    #[serde(deserialize_with = "de_u64")]
    sequence: u64,
    route: RouteDto,
    is_active: bool,
}

#[derive(Debug, Deserialize)]
struct RouteDto {
    #[serde(default)]
    destination_chain_id: String,
    #[serde(default)]
    destination_contract_address: String,
}

impl From<TunnelDto> for BandTunnel {
    fn from(dto: TunnelDto) -> Self {
        BandTunnel {
            id: dto.id,
            latest_sequence: dto.sequence,
            target_chain: dto.route.destination_chain_id,
            target_address: dto.route.destination_contract_address,
            is_active: dto.is_active,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PacketResponse {
    packet: PacketDto,
}

#[derive(Debug, Deserialize)]
struct PacketDto {
    #[serde(deserialize_with = "de_u64")]
    tunnel_id: u64,
    #[serde(deserialize_with = "de_u64")]
    sequence: u64,
    #[serde(default)]
    prices: Vec<PriceDto>,
    receipt: Option<ReceiptDto>,
}

#[derive(Debug, Deserialize)]
struct PriceDto {
    signal_id: String,
    #[serde(deserialize_with = "de_u64")]
    price: u64,
}

#[derive(Debug, Deserialize)]
struct ReceiptDto {
    #[serde(default, deserialize_with = "de_u64")]
    signing_id: u64,
}

#[derive(Debug, Deserialize)]
struct SigningResponse {
    current_group_signing_result: Option<SigningResultDto>,
    incoming_group_signing_result: Option<SigningResultDto>,
}

#[derive(Debug, Deserialize)]
struct SigningResultDto {
    signing: SigningDto,
    evm_signature: Option<EvmSignatureDto>,
}

#[derive(Debug, Deserialize)]
struct SigningDto {
    #[serde(deserialize_with = "de_u64")]
    id: u64,
    #[serde(default, deserialize_with = "de_base64")]
    message: Vec<u8>,
    status: String,
    #[serde(default)]
    created_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct EvmSignatureDto {
    #[serde(deserialize_with = "de_base64")]
    r_address: Vec<u8>,
    #[serde(deserialize_with = "de_base64")]
    signature: Vec<u8>,
}

impl From<SigningResultDto> for Signing {
    fn from(dto: SigningResultDto) -> Self {
        Signing {
            id: dto.signing.id,
            message: dto.signing.message,
            evm_signature: dto.evm_signature.map(|sig| EvmSignature {
                r_address: sig.r_address,
                signature: sig.signature,
            }),
            status: SigningStatus::from_proto_name(&dto.signing.status),
            created_at: dto.signing.created_timestamp,
        }
    }
}

fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        Raw::Num(n) => Ok(n),
    }
}

fn de_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}
