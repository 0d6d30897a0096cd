//! Peer-to-peer networking: address book, reputation, transport, request
//! routing and gossip.

pub mod address;
pub mod address_book;
pub mod error;
pub mod hallmark;
mod handlers;
pub mod network;
pub mod peer;
pub mod peer_store;
pub mod propagator;
pub mod reputation;
pub mod router;
pub mod scheduler;
pub mod selection;
pub mod server;
pub mod transport;

#[cfg(test)]
pub mod test_utils;

pub use address::{Resolver, StaticResolver, SystemResolver};
pub use address_book::AddressBook;
pub use error::{PeerError, TransportError};
pub use network::{Collaborators, Network};
pub use peer::{BlockchainState, Peer, PeerEvent, PeerState, Services};
pub use peer_store::{PeerStore, SavedPeer};
pub use reputation::Reputation;
pub use router::RequestRouter;
