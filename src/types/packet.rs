use super::signing::Signing;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalPrice {
    pub signal_id: String,
    pub price: u64,
}

/// Sequenced, signed batch of prices produced by BandChain for one tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub tunnel_id: u64,
    pub sequence: u64,
    pub signal_prices: Vec<SignalPrice>,
    pub current_group_signing: Option<Signing>,
    /// Present only while a signer group transition is in progress
    pub incoming_group_signing: Option<Signing>,
}

impl Packet {
    /// Signing that decides whether the packet can be relayed: the current
    /// group's, or the incoming group's when the current one is absent.
    pub fn authoritative_signing(&self) -> Option<&Signing> {
        self.current_group_signing
            .as_ref()
            .or(self.incoming_group_signing.as_ref())
    }

    /// All signings attached to the packet
    pub fn signings(&self) -> impl Iterator<Item = &Signing> {
        self.current_group_signing
            .iter()
            .chain(self.incoming_group_signing.iter())
    }
}
