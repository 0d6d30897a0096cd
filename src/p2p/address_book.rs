//! Known-peer registry.
//!
//! Peers are keyed by resolved IP. A secondary index maps announced
//! addresses back to hosts; every membership change (insert, remove,
//! collision eviction) happens under one short `membership` lock so the
//! index never points at a peer that is gone. Reads go straight to the
//! concurrent maps.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use super::address::{
    address_with_port, is_peerable_ip, parse_address, Resolver, MAX_ANNOUNCED_ADDRESS_LENGTH,
};
use super::error::{PeerError, TransportError};
use super::peer::{Peer, PeerEvent, PeerShared};
use crate::config::NetworkConfig;

#[derive(Debug, Clone)]
struct BookLimits {
    my_address: Option<String>,
    min_known: usize,
    max_known: usize,
    local_test_mode: bool,
    testnet: bool,
    testnet_port: u16,
    default_port: u16,
}

pub struct AddressBook {
    peers: DashMap<String, Arc<Peer>>,
    announced: DashMap<String, String>,
    membership: Mutex<()>,
    resolver: Arc<dyn Resolver>,
    shared: Arc<PeerShared>,
    limits: BookLimits,
}

impl AddressBook {
    pub fn new(config: &NetworkConfig, shared: Arc<PeerShared>, resolver: Arc<dyn Resolver>) -> Self {
        let default_port = config.default_peer_port();
        Self {
            peers: DashMap::new(),
            announced: DashMap::new(),
            membership: Mutex::new(()),
            resolver,
            shared,
            limits: BookLimits {
                my_address: config
                    .my_address
                    .as_deref()
                    .and_then(|a| address_with_port(a, default_port)),
                min_known: config.min_known_peers,
                max_known: config.max_known_peers,
                local_test_mode: config.local_test_mode,
                testnet: config.testnet,
                testnet_port: config.testnet_peer_port,
                default_port,
            },
        }
    }

    pub fn shared(&self) -> &Arc<PeerShared> {
        &self.shared
    }

    pub fn default_port(&self) -> u16 {
        self.limits.default_port
    }

    pub fn get(&self, host: &str) -> Option<Arc<Peer>> {
        self.peers.get(host).map(|p| p.value().clone())
    }

    pub fn get_by_announced(&self, address: &str) -> Option<Arc<Peer>> {
        let host = self.announced.get(address).map(|h| h.value().clone())?;
        self.get(&host)
    }

    /// Snapshot of every known peer
    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    pub fn filter(&self, pred: impl Fn(&Peer) -> bool) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|p| pred(p.value()))
            .map(|p| p.value().clone())
            .collect()
    }

    /// Count matching peers, stopping early at `limit`
    pub fn count_up_to(&self, limit: usize, pred: impl Fn(&Peer) -> bool) -> usize {
        self.peers.iter().filter(|p| pred(p.value())).take(limit).count()
    }

    pub fn size(&self) -> usize {
        self.peers.len()
    }

    pub fn too_many(&self) -> bool {
        self.size() > self.limits.max_known
    }

    pub fn too_few(&self) -> bool {
        self.size() < self.limits.min_known
    }

    pub fn min_known(&self) -> usize {
        self.limits.min_known
    }

    pub fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, TransportError> {
        self.resolver.resolve(host)
    }

    /// True when `address` resolves to `ip`
    pub fn resolves_to(&self, address: &str, ip: &str) -> Result<bool, TransportError> {
        let Some(parsed) = parse_address(address) else {
            return Ok(false);
        };
        let Ok(ip) = ip.parse::<IpAddr>() else {
            return Ok(false);
        };
        Ok(self.resolver.resolve(&parsed.host)?.contains(&ip))
    }

    /// Look up a peer by announced address or host, creating and inserting
    /// it when `create` is set. Unusable addresses yield None.
    pub fn select_or_create(&self, address: &str, create: bool) -> Option<Arc<Peer>> {
        self.select_or_create_entry(address, create).map(|(p, _)| p)
    }

    /// As [`select_or_create`](Self::select_or_create), also reporting
    /// whether the peer was created by this call.
    pub fn select_or_create_entry(&self, address: &str, create: bool) -> Option<(Arc<Peer>, bool)> {
        let address = address.trim().to_ascii_lowercase();
        if let Some(peer) = self.get(&address).or_else(|| self.get_by_announced(&address)) {
            return Some((peer, false));
        }
        let parsed = parse_address(&address)?;
        if let Some(peer) = self
            .get(&parsed.host)
            .or_else(|| self.get_by_announced(&parsed.host))
        {
            return Some((peer, false));
        }
        let ip = *self.resolver.resolve(&parsed.host).ok()?.first()?;
        let announced = address_with_port(&address, self.limits.default_port);
        self.find_or_create_ip(ip, announced, create)
    }

    /// Async wrapper that keeps DNS lookups off the runtime threads
    pub async fn select_or_create_async(
        self: &Arc<Self>,
        address: String,
        create: bool,
    ) -> Option<(Arc<Peer>, bool)> {
        let book = self.clone();
        tokio::task::spawn_blocking(move || book.select_or_create_entry(&address, create))
            .await
            .ok()
            .flatten()
    }

    /// Peer for a resolved IP. `announced` is only used when creating.
    pub fn find_or_create_ip(
        &self,
        ip: IpAddr,
        announced: Option<String>,
        create: bool,
    ) -> Option<(Arc<Peer>, bool)> {
        if !is_peerable_ip(&ip, self.limits.local_test_mode) {
            return None;
        }
        let host = ip.to_string();
        if let Some(peer) = self.get(&host) {
            return Some((peer, false));
        }
        if !create {
            return None;
        }
        if let (Some(mine), Some(addr)) = (&self.limits.my_address, &announced) {
            if mine.eq_ignore_ascii_case(addr) {
                return None;
            }
        }
        if announced
            .as_ref()
            .is_some_and(|a| a.len() > MAX_ANNOUNCED_ADDRESS_LENGTH)
        {
            return None;
        }
        let port = announced
            .as_deref()
            .and_then(parse_address)
            .map(|a| a.port_or(self.limits.default_port))
            .unwrap_or(self.limits.default_port);
        if self.limits.testnet != (port == self.limits.testnet_port) {
            debug!(
                peer = %host,
                port,
                testnet = self.limits.testnet,
                "[PEERS] Ignoring peer on the wrong network port"
            );
            return None;
        }

        let (peer, created) = {
            let _membership = self.membership.lock();
            match self.peers.entry(host.clone()) {
                Entry::Occupied(e) => (e.get().clone(), false),
                Entry::Vacant(v) => {
                    let peer = Arc::new(Peer::new(host.clone(), announced.clone(), self.shared.clone()));
                    v.insert(peer.clone());
                    if let Some(addr) = announced {
                        self.announced.entry(addr).or_insert(host);
                    }
                    (peer, true)
                }
            }
        };
        if created {
            peer.notify(PeerEvent::NewPeer);
        }
        Some((peer, created))
    }

    /// Insert a detached peer record. Returns whether it was new.
    pub fn add(&self, peer: Arc<Peer>) -> bool {
        let inserted = {
            let _membership = self.membership.lock();
            match self.peers.entry(peer.host().to_string()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(v) => {
                    v.insert(peer.clone());
                    if let Some(addr) = peer.announced_address() {
                        self.announced
                            .entry(addr)
                            .or_insert_with(|| peer.host().to_string());
                    }
                    true
                }
            }
        };
        if inserted {
            peer.notify(PeerEvent::NewPeer);
        }
        inserted
    }

    /// Remove a peer and its announced-address mapping. Returns false when
    /// this exact record was not in the book.
    pub fn remove(&self, peer: &Arc<Peer>) -> bool {
        let removed = {
            let _membership = self.membership.lock();
            self.detach(peer)
        };
        if removed {
            peer.close_channel();
            peer.notify(PeerEvent::Remove);
        }
        removed
    }

    // Caller holds the membership lock.
    fn detach(&self, peer: &Arc<Peer>) -> bool {
        let removed = self
            .peers
            .remove_if(peer.host(), |_, p| Arc::ptr_eq(p, peer))
            .is_some();
        if removed {
            if let Some(addr) = peer.announced_address() {
                self.announced.remove_if(&addr, |_, host| host == peer.host());
            }
        }
        removed
    }

    /// Change a peer's announced address. A different peer currently owning
    /// the address is evicted from the book.
    pub fn set_announced_address(&self, peer: &Arc<Peer>, address: &str) -> Result<(), PeerError> {
        let address = address_with_port(address, self.limits.default_port)
            .ok_or_else(|| PeerError::invalid("announced address", address))?;

        let (evicted, changed) = {
            let _membership = self.membership.lock();
            let owner = self
                .announced
                .get(&address)
                .map(|h| h.value().clone())
                .or_else(|| self.peers.contains_key(&address).then(|| address.clone()))
                .filter(|host| host != peer.host())
                .and_then(|host| self.get(&host));
            let evicted = owner.filter(|old| self.detach(old));

            let previous = peer.announced_address();
            let changed = peer.replace_announced_address(Some(address.clone()))?;
            if let Some(previous) = previous.filter(|p| *p != address) {
                self.announced.remove_if(&previous, |_, host| host == peer.host());
            }
            if self.peers.contains_key(peer.host()) {
                self.announced.insert(address.clone(), peer.host().to_string());
            }
            (evicted, changed)
        };

        if let Some(old) = evicted {
            debug!(
                evicted = %old.host(),
                peer = %peer.host(),
                address = %address,
                "[PEERS] Announced address taken over, removing old peer"
            );
            old.close_channel();
            old.notify(PeerEvent::Remove);
        }
        if changed {
            peer.notify(PeerEvent::ChangedAnnouncedAddress);
        }
        Ok(())
    }
}
