//! Relay engine
//!
//! This module provides:
//! - `TunnelRelayer`, the per-tunnel check-and-relay state machine
//! - `Scheduler`, which polls every tunnel with penalty backoff
//! - `PacketHandler`, which turns BandChain events into scheduler triggers

mod packet_handler;
mod scheduler;
mod signing_cache;
mod tunnel;

pub use packet_handler::{PacketHandler, SigningResult};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
pub use signing_cache::{SigningCache, SIGNING_CACHE_TTL};
pub use tunnel::TunnelRelayer;
