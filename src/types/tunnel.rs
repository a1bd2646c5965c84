use ethers::types::U256;

/// Tunnel as recorded on BandChain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandTunnel {
    pub id: u64,
    /// Latest packet sequence produced on BandChain
    pub latest_sequence: u64,
    /// Name of the destination chain, matching a `[chains.<name>]` entry
    pub target_chain: String,
    /// Destination contract the packets are addressed to
    pub target_address: String,
    pub is_active: bool,
}

/// Tunnel state as reported by the target chain's router contract
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChainTunnel {
    /// Latest sequence already applied on the target chain
    pub latest_sequence: u64,
    pub is_active: bool,
    /// Fee deposit held by the router for this tunnel
    pub balance: U256,
}

/// Combined view of a tunnel on both sides of the relay route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub band: BandTunnel,
    pub chain: ChainTunnel,
}

impl Tunnel {
    /// Next sequence the target chain expects
    pub fn next_sequence(&self) -> u64 {
        self.chain.latest_sequence.saturating_add(1)
    }

    /// Whether BandChain has produced the packet the target chain expects next
    pub fn has_pending_packet(&self) -> bool {
        self.band.latest_sequence >= self.next_sequence()
    }
}
