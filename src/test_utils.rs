//! In-memory collaborators shared by unit tests

use crate::chain::ChainProvider;
use crate::error::{RelayerError, RelayerResult};
use crate::gas::Source;
use crate::types::{BandTunnel, ChainTunnel, EvmSignature, Packet, Signing, SigningStatus};

use async_trait::async_trait;
use ethers::types::U256;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const TEST_CHAIN: &str = "eth";
pub const TEST_ADDRESS: &str = "0x1111111111111111111111111111111111111111";

pub struct FakeSource {
    name: String,
    value: Option<u64>,
    delay: Option<Duration>,
}

impl FakeSource {
    pub fn value(name: &str, value: u64) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value),
            delay: None,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Source for FakeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_data(&self) -> RelayerResult<u64> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.value
            .ok_or_else(|| RelayerError::GasEstimation(format!("{} is down", self.name)))
    }
}

/// Target chain whose router state lives in memory
pub struct FakeChain {
    latest_sequence: AtomicU64,
    active: AtomicBool,
    advance_on_relay: AtomicBool,
    fail_relay: AtomicBool,
    panic_relay: AtomicBool,
    query_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    queries: AtomicUsize,
    relayed: Mutex<Vec<u64>>,
}

impl FakeChain {
    pub fn new(latest_sequence: u64) -> Self {
        Self {
            latest_sequence: AtomicU64::new(latest_sequence),
            active: AtomicBool::new(true),
            advance_on_relay: AtomicBool::new(true),
            fail_relay: AtomicBool::new(false),
            panic_relay: AtomicBool::new(false),
            query_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            relayed: Mutex::new(Vec::new()),
        }
    }

    pub fn inactive(self) -> Self {
        self.active.store(false, Ordering::SeqCst);
        self
    }

    /// Accept relays without moving the router's sequence
    pub fn stuck(self) -> Self {
        self.advance_on_relay.store(false, Ordering::SeqCst);
        self
    }

    pub fn failing_relay(self) -> Self {
        self.fail_relay.store(true, Ordering::SeqCst);
        self
    }

    pub fn panicking_relay(self) -> Self {
        self.panic_relay.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    pub fn relayed(&self) -> Vec<u64> {
        self.relayed.lock().unwrap().clone()
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainProvider for FakeChain {
    fn chain_name(&self) -> &str {
        TEST_CHAIN
    }

    async fn init(&self) -> RelayerResult<()> {
        Ok(())
    }

    async fn query_tunnel_info(
        &self,
        _tunnel_id: u64,
        _tunnel_destination_address: &str,
    ) -> RelayerResult<ChainTunnel> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.queries.fetch_add(1, Ordering::SeqCst);

        if !self.query_delay.is_zero() {
            tokio::time::sleep(self.query_delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ChainTunnel {
            latest_sequence: self.latest_sequence.load(Ordering::SeqCst),
            is_active: self.active.load(Ordering::SeqCst),
            balance: U256::from(1_000_000u64),
        })
    }

    async fn relay_packet(
        &self,
        packet: &Packet,
        _tunnel_destination_address: &str,
    ) -> RelayerResult<()> {
        if self.panic_relay.load(Ordering::SeqCst) {
            panic!("router exploded at sequence {}", packet.sequence);
        }
        if self.fail_relay.load(Ordering::SeqCst) {
            return Err(RelayerError::Transaction("execution reverted".to_string()));
        }

        self.relayed.lock().unwrap().push(packet.sequence);
        if self.advance_on_relay.load(Ordering::SeqCst) {
            self.latest_sequence.store(packet.sequence, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub fn band_tunnel(id: u64, latest_sequence: u64) -> BandTunnel {
    BandTunnel {
        id,
        latest_sequence,
        target_chain: TEST_CHAIN.to_string(),
        target_address: TEST_ADDRESS.to_string(),
        is_active: true,
    }
}

pub fn signing(id: u64, status: SigningStatus) -> Signing {
    Signing {
        id,
        message: vec![0xaa; 8],
        evm_signature: Some(EvmSignature {
            r_address: vec![0x22; 20],
            signature: vec![0x33; 32],
        }),
        status,
        created_at: None,
    }
}

pub fn packet(
    tunnel_id: u64,
    sequence: u64,
    current: Option<Signing>,
    incoming: Option<Signing>,
) -> Packet {
    Packet {
        tunnel_id,
        sequence,
        signal_prices: Vec::new(),
        current_group_signing: current,
        incoming_group_signing: incoming,
    }
}

/// Packet whose current-group signing has the given status; the signing ID
/// is derived from the sequence
pub fn signed_packet(tunnel_id: u64, sequence: u64, status: SigningStatus) -> Packet {
    packet(tunnel_id, sequence, Some(signing(sequence * 100, status)), None)
}
