//! Prometheus metrics for the peer network.
//!
//! Counters are driven by peer events; population and traffic gauges are
//! recomputed from the address book when `/metrics` is scraped.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use crate::p2p::address_book::AddressBook;
use crate::p2p::peer::{PeerEvent, PeerEvents, PeerState};

pub struct NetworkMetrics {
    registry: Registry,
    new_peers: IntCounter,
    blacklisted: IntCounter,
    removed: IntCounter,
    known_peers: IntGauge,
    active_peers: IntGauge,
    uploaded_bytes: IntGauge,
    downloaded_bytes: IntGauge,
}

impl NetworkMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let new_peers = IntCounter::new("forge_peers_discovered_total", "Peers added to the address book")?;
        let blacklisted = IntCounter::new("forge_peers_blacklisted_total", "Peers blacklisted")?;
        let removed = IntCounter::new("forge_peers_removed_total", "Peers removed from the address book")?;
        let known_peers = IntGauge::new("forge_peers_known", "Peers in the address book")?;
        let active_peers = IntGauge::new("forge_peers_connected", "Peers in the CONNECTED state")?;
        let uploaded_bytes = IntGauge::new("forge_peer_uploaded_bytes", "Bytes sent to known peers")?;
        let downloaded_bytes =
            IntGauge::new("forge_peer_downloaded_bytes", "Bytes received from known peers")?;

        registry.register(Box::new(new_peers.clone()))?;
        registry.register(Box::new(blacklisted.clone()))?;
        registry.register(Box::new(removed.clone()))?;
        registry.register(Box::new(known_peers.clone()))?;
        registry.register(Box::new(active_peers.clone()))?;
        registry.register(Box::new(uploaded_bytes.clone()))?;
        registry.register(Box::new(downloaded_bytes.clone()))?;

        Ok(Self {
            registry,
            new_peers,
            blacklisted,
            removed,
            known_peers,
            active_peers,
            uploaded_bytes,
            downloaded_bytes,
        })
    }

    /// Hook the counters onto the peer event bus.
    pub fn attach(self: &Arc<Self>, events: &PeerEvents) {
        let m = self.clone();
        events.subscribe(PeerEvent::NewPeer, move |_| m.new_peers.inc());
        let m = self.clone();
        events.subscribe(PeerEvent::Blacklist, move |_| m.blacklisted.inc());
        let m = self.clone();
        events.subscribe(PeerEvent::Remove, move |_| m.removed.inc());
    }

    /// Refresh the gauges from `book` and encode the registry as text.
    pub fn render(&self, book: &AddressBook) -> String {
        let peers = book.all();
        self.known_peers.set(peers.len() as i64);
        self.active_peers.set(
            peers
                .iter()
                .filter(|p| p.state() == PeerState::Connected)
                .count() as i64,
        );
        let uploaded: u64 = peers.iter().map(|p| p.uploaded()).sum();
        let downloaded: u64 = peers.iter().map(|p| p.downloaded()).sum();
        self.uploaded_bytes.set(uploaded.min(i64::MAX as u64) as i64);
        self.downloaded_bytes.set(downloaded.min(i64::MAX as u64) as i64);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .ok();
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::address::StaticResolver;
    use crate::p2p::test_utils::{shared_with_clock, test_config};

    #[test]
    fn counts_events_and_population() {
        let (shared, _) = shared_with_clock(1_000);
        let book = AddressBook::new(&test_config(), shared.clone(), Arc::new(StaticResolver::new()));
        let metrics = Arc::new(NetworkMetrics::new().unwrap());
        metrics.attach(&shared.events);

        let a = book.select_or_create("198.51.100.1", true).unwrap();
        let b = book.select_or_create("198.51.100.2", true).unwrap();
        a.set_state(PeerState::Connected);
        a.add_uploaded(120);
        b.add_downloaded(30);
        b.blacklist("test");
        book.remove(&b);

        let text = metrics.render(&book);
        assert!(text.contains("forge_peers_discovered_total 2"));
        assert!(text.contains("forge_peers_blacklisted_total 1"));
        assert!(text.contains("forge_peers_removed_total 1"));
        assert!(text.contains("forge_peers_known 1"));
        assert!(text.contains("forge_peers_connected 1"));
        assert!(text.contains("forge_peer_uploaded_bytes 120"));
    }
}
