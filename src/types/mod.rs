//! Domain types shared by the BandChain client, chain providers and the relay engine

mod packet;
mod signing;
mod tunnel;

pub use packet::{Packet, SignalPrice};
pub use signing::{EvmSignature, Signing, SigningStatus};
pub use tunnel::{BandTunnel, ChainTunnel, Tunnel};
