//! Blacklisting policy, hallmark checks and peer weights.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::address::parse_address;
use super::address_book::AddressBook;
use super::error::PeerError;
use super::hallmark::{Hallmark, MAX_BALANCE};
use super::peer::{Peer, PeerEvent};
use crate::chain::{AccountId, Blockchain};
use crate::config::NetworkConfig;

pub struct Reputation {
    book: Arc<AddressBook>,
    chain: Arc<dyn Blockchain>,
    blacklisting_period: u64,
    hide_error_details: bool,
    light_client: bool,
    group_lock: Mutex<()>,
}

impl Reputation {
    pub fn new(config: &NetworkConfig, book: Arc<AddressBook>, chain: Arc<dyn Blockchain>) -> Self {
        Self {
            book,
            chain,
            blacklisting_period: config.blacklisting_period_secs,
            hide_error_details: config.hide_error_details,
            light_client: config.light_client,
            group_lock: Mutex::new(()),
        }
    }

    pub fn blacklisting_period(&self) -> u64 {
        self.blacklisting_period
    }

    pub fn blacklist(&self, peer: &Arc<Peer>, cause: &str) {
        if !peer.is_blacklisted() {
            debug!(peer = %peer.host(), cause, "[PEERS] Blacklisting");
        }
        peer.blacklist(cause);
    }

    /// Blacklist for a failure unless the failure is an expected condition.
    /// Returns whether the peer was blacklisted.
    pub fn blacklist_for(&self, peer: &Arc<Peer>, err: &PeerError) -> bool {
        if err.is_benign() {
            debug!(peer = %peer.host(), error = %err, "[PEERS] Not blacklisting for benign failure");
            return false;
        }
        let cause = if self.hide_error_details {
            err.kind().to_string()
        } else {
            err.to_string()
        };
        if !peer.is_blacklisted() {
            match err {
                PeerError::Validation(_) => {
                    info!(peer = %peer.host(), cause = %cause, "[PEERS] Blacklisting")
                }
                _ => debug!(peer = %peer.host(), cause = %cause, "[PEERS] Blacklisting"),
            }
        }
        peer.blacklist(cause);
        true
    }

    pub fn unblacklist(&self, peer: &Arc<Peer>) -> bool {
        peer.unblacklist()
    }

    pub fn update_expiry(&self, peer: &Arc<Peer>, now: u64) {
        peer.update_blacklisted_status(now, self.blacklisting_period);
    }

    /// Run expiry over the whole book
    pub fn sweep(&self, now: u64) {
        for peer in self.book.all() {
            self.update_expiry(&peer, now);
        }
    }

    pub fn weight(&self, peer: &Peer) -> u64 {
        peer.weight(self.chain.as_ref())
    }

    /// Accept an announced address only if it resolves to the peer's host.
    /// A hallmark whose port disagrees with the address is dropped.
    pub fn verify_announced_address(&self, peer: &Arc<Peer>, address: &str) -> bool {
        let Some(parsed) = parse_address(address) else {
            return false;
        };
        let announced_port = parsed.port_or(self.book.default_port());
        if let Some(hallmark) = peer.hallmark() {
            if hallmark.port() != announced_port {
                debug!(
                    peer = %peer.host(),
                    announced_port,
                    hallmark_port = hallmark.port(),
                    "[PEERS] Announced port does not match hallmark, ignoring hallmark"
                );
                peer.set_hallmark(None);
            }
        }
        match self.book.resolves_to(&parsed.host, peer.host()) {
            Ok(true) => true,
            Ok(false) => {
                debug!(peer = %peer.host(), address, "[PEERS] Announced address does not resolve to peer");
                false
            }
            Err(e) => {
                self.blacklist(peer, &e.to_string());
                false
            }
        }
    }

    /// Check a hallmark announced by `peer`. On success the peer's hallmark
    /// group is renormalised; on failure any hallmark is cleared.
    pub fn analyze_hallmark(&self, peer: &Arc<Peer>, encoded: Option<&str>) -> bool {
        if self.light_client {
            return true;
        }
        let current = peer.hallmark();
        let Some(encoded) = encoded.map(|e| e.trim().to_ascii_lowercase()).filter(|e| !e.is_empty())
        else {
            if current.is_some() {
                peer.set_hallmark(None);
            }
            return true;
        };
        if current.as_ref().is_some_and(|h| h.encoded() == encoded) {
            return true;
        }

        let hallmark = match Hallmark::parse(&encoded, self.book.default_port()) {
            Ok(h) => h,
            Err(e) => {
                debug!(peer = %peer.host(), error = %e, "[PEERS] Failed to parse hallmark");
                peer.set_hallmark(None);
                return false;
            }
        };
        if !hallmark.is_valid() {
            debug!(peer = %peer.host(), "[PEERS] Invalid hallmark");
            peer.set_hallmark(None);
            return false;
        }
        let host_name = hallmark.host_name();
        if host_name != peer.host() && !matches!(self.book.resolves_to(&host_name, peer.host()), Ok(true)) {
            debug!(peer = %peer.host(), hallmark_host = %host_name, "[PEERS] Hallmark host doesn't match");
            peer.set_hallmark(None);
            return false;
        }

        let account = hallmark.account_id();
        peer.set_hallmark(Some(hallmark));
        self.renormalize_group(peer, account);
        true
    }

    /// Spread the full weight range across every peer hallmarked by the
    /// same account, counting only hallmarks with the group's latest date.
    fn renormalize_group(&self, peer: &Arc<Peer>, account: AccountId) {
        let group = {
            let _group = self.group_lock.lock();
            let mut group = self
                .book
                .filter(|p| p.hallmark().is_some_and(|h| h.account_id() == account));
            if !group.iter().any(|p| Arc::ptr_eq(p, peer)) {
                group.push(peer.clone());
            }
            let most_recent = group
                .iter()
                .filter_map(|p| p.hallmark().map(|h| h.date()))
                .max()
                .unwrap_or(0);
            let total: u64 = group.iter().map(|p| p.hallmark_weight_at(most_recent)).sum();
            for p in &group {
                let adjusted = if total == 0 {
                    0
                } else {
                    MAX_BALANCE * p.hallmark_weight_at(most_recent) / total
                };
                p.set_adjusted_weight(adjusted);
            }
            group
        };
        for p in group {
            p.notify(PeerEvent::Weight);
        }
    }
}
