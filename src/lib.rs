//! Forge node: the peer-to-peer gossip layer of a forging full node.

pub mod chain;
pub mod clock;
pub mod config;
pub mod events;
pub mod metrics;
pub mod p2p;
pub mod version;
