//! BandChain access
//!
//! The relay engine only depends on the `BandClient` trait; `RestBandClient`
//! implements it over the chain's LCD REST API.

mod client;

pub use client::RestBandClient;

use crate::error::RelayerResult;
use crate::types::{BandTunnel, Packet};

use async_trait::async_trait;

/// Read access to tunnels and packets on BandChain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BandClient: Send + Sync {
    /// Fetch a single tunnel
    async fn get_tunnel(&self, tunnel_id: u64) -> RelayerResult<BandTunnel>;

    /// Fetch the packet at `sequence` together with its group signings
    async fn get_tunnel_packet(&self, tunnel_id: u64, sequence: u64) -> RelayerResult<Packet>;

    /// Fetch every tunnel known to BandChain
    async fn get_tunnels(&self) -> RelayerResult<Vec<BandTunnel>>;
}
