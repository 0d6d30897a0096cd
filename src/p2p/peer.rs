//! Per-peer record and connection state machine.
//!
//! Every mutable field sits behind the peer's own mutex, so state changes on
//! one peer never block another. Events produced by a change are published
//! after the lock is released.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::address::{parse_address, MAX_ANNOUNCED_ADDRESS_LENGTH};
use super::error::PeerError;
use super::hallmark::{Hallmark, MAX_BALANCE, ONE_UNIT};
use super::transport::Channel;
use crate::chain::Blockchain;
use crate::clock::Clock;
use crate::events::Listeners;
use crate::version::is_old_version;

pub const MAX_APPLICATION_LENGTH: usize = 20;
pub const MAX_VERSION_LENGTH: usize = 10;
pub const MAX_PLATFORM_LENGTH: usize = 30;

/// Refresh the cached hallmark balance after this many blocks
const BALANCE_REFRESH_BLOCKS: u32 = 60;
/// An old-version flag is dropped once the peer has been quiet this long
const OLD_VERSION_RESET_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    NonConnected,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEvent {
    NewPeer,
    AddedActivePeer,
    ChangedActivePeer,
    Deactivate,
    Blacklist,
    Unblacklist,
    Remove,
    ChangedServices,
    ChangedAnnouncedAddress,
    Weight,
    UploadedVolume,
    DownloadedVolume,
    AddInbound,
    RemoveInbound,
}

pub type PeerEvents = Listeners<PeerEvent, Arc<Peer>>;

/// Capability bitmask announced by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Services(pub u64);

impl Services {
    pub const HALLMARK: u64 = 1;
    pub const PRUNABLE: u64 = 2;
    pub const API: u64 = 4;
    pub const API_SSL: u64 = 8;
    pub const CORS: u64 = 16;

    pub fn contains(self, flag: u64) -> bool {
        self.0 & flag == flag
    }

    pub fn with(self, flag: u64) -> Self {
        Services(self.0 | flag)
    }

    pub fn without(self, flag: u64) -> Self {
        Services(self.0 & !flag)
    }

    /// Unsigned decimal string, as carried on the wire
    pub fn to_wire(self) -> String {
        self.0.to_string()
    }

    pub fn from_wire(value: Option<&Value>) -> Self {
        Services(value.and_then(crate::chain::parse_id).unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockchainState {
    UpToDate,
    Downloading,
    LightClient,
    Fork,
}

/// Settings and services every peer record needs.
pub struct PeerShared {
    pub events: PeerEvents,
    pub clock: Arc<dyn Clock>,
    pub known_blacklisted: HashSet<String>,
    pub default_port: u16,
    pub min_version: Vec<u32>,
}

#[derive(Default)]
struct Effects {
    events: Vec<PeerEvent>,
    closed: Option<Arc<Channel>>,
}

struct PeerInner {
    announced_address: Option<String>,
    port: u16,
    state: PeerState,
    services: Services,
    application: Option<String>,
    version: Option<String>,
    platform: Option<String>,
    share_address: bool,
    blockchain_state: Option<BlockchainState>,
    hallmark: Option<Hallmark>,
    adjusted_weight: u64,
    hallmark_balance: Option<i64>,
    hallmark_balance_height: u32,
    blacklisting_time: u64,
    blacklisting_cause: Option<String>,
    is_old_version: bool,
    last_updated: u64,
    last_connect_attempt: u64,
    last_inbound_request: u64,
    channel: Option<Arc<Channel>>,
}

impl PeerInner {
    fn set_state(&mut self, state: PeerState, fx: &mut Effects) {
        if state != PeerState::Connected {
            if let Some(channel) = self.channel.take() {
                fx.closed = Some(channel);
            }
        }
        if self.state == state {
            return;
        }
        let event = if self.state == PeerState::NonConnected {
            PeerEvent::AddedActivePeer
        } else {
            PeerEvent::ChangedActivePeer
        };
        self.state = state;
        fx.events.push(event);
    }

    fn set_hallmark(&mut self, hallmark: Option<Hallmark>) {
        self.services = match hallmark {
            Some(_) => self.services.with(Services::HALLMARK),
            None => self.services.without(Services::HALLMARK),
        };
        if hallmark.is_none() {
            self.adjusted_weight = 0;
            self.hallmark_balance = None;
        }
        self.hallmark = hallmark;
    }
}

pub struct Peer {
    host: String,
    shared: Arc<PeerShared>,
    inner: Mutex<PeerInner>,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("host", &self.host)
            .field("state", &self.state())
            .field("announced_address", &self.announced_address())
            .finish()
    }
}

fn port_of(announced: Option<&str>, default_port: u16) -> u16 {
    announced
        .and_then(parse_address)
        .map(|a| a.port_or(default_port))
        .unwrap_or(default_port)
}

impl Peer {
    pub fn new(
        host: impl Into<String>,
        announced_address: Option<String>,
        shared: Arc<PeerShared>,
    ) -> Self {
        let port = port_of(announced_address.as_deref(), shared.default_port);
        Self {
            host: host.into(),
            inner: Mutex::new(PeerInner {
                announced_address,
                port,
                state: PeerState::NonConnected,
                services: Services::default(),
                application: None,
                version: None,
                platform: None,
                share_address: true,
                blockchain_state: None,
                hallmark: None,
                adjusted_weight: 0,
                hallmark_balance: None,
                hallmark_balance_height: 0,
                blacklisting_time: 0,
                blacklisting_cause: None,
                is_old_version: false,
                last_updated: 0,
                last_connect_attempt: 0,
                last_inbound_request: 0,
                channel: None,
            }),
            shared,
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn apply<R>(self: &Arc<Self>, f: impl FnOnce(&mut PeerInner, &mut Effects) -> R) -> R {
        let mut fx = Effects::default();
        let result = {
            let mut inner = self.inner.lock();
            f(&mut inner, &mut fx)
        };
        if let Some(channel) = fx.closed {
            channel.close();
        }
        for event in fx.events {
            self.shared.events.publish(event, self);
        }
        result
    }

    pub fn notify(self: &Arc<Self>, event: PeerEvent) {
        self.shared.events.publish(event, self);
    }

    pub(crate) fn shared(&self) -> &Arc<PeerShared> {
        &self.shared
    }

    pub(crate) fn connect_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.connect_lock
    }

    fn now(&self) -> u64 {
        self.shared.clock.now()
    }

    // ---- identity ---------------------------------------------------------

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn announced_address(&self) -> Option<String> {
        self.inner.lock().announced_address.clone()
    }

    pub fn port(&self) -> u16 {
        self.inner.lock().port
    }

    /// Only called by the address book, which keeps the reverse index in
    /// step and publishes CHANGED_ANNOUNCED_ADDRESS. Returns true on change.
    pub(crate) fn replace_announced_address(
        &self,
        address: Option<String>,
    ) -> Result<bool, PeerError> {
        if let Some(addr) = &address {
            if addr.len() > MAX_ANNOUNCED_ADDRESS_LENGTH {
                return Err(PeerError::invalid("announced address", "too long"));
            }
        }
        let mut inner = self.inner.lock();
        if inner.announced_address == address {
            return Ok(false);
        }
        inner.port = port_of(address.as_deref(), self.shared.default_port);
        inner.announced_address = address;
        Ok(true)
    }

    // ---- state machine ----------------------------------------------------

    pub fn state(&self) -> PeerState {
        self.inner.lock().state
    }

    pub fn set_state(self: &Arc<Self>, state: PeerState) {
        self.apply(|inner, fx| inner.set_state(state, fx));
    }

    /// Drop the peer out of the active set after an error response.
    pub fn deactivate(self: &Arc<Self>) {
        self.apply(|inner, fx| {
            inner.set_state(PeerState::NonConnected, fx);
            fx.events.push(PeerEvent::Deactivate);
        });
    }

    /// A transport failure: a connected peer becomes DISCONNECTED and may be
    /// revived by its next inbound request.
    pub fn transport_failed(self: &Arc<Self>) {
        self.apply(|inner, fx| {
            let next = if inner.state == PeerState::Connected {
                PeerState::Disconnected
            } else {
                PeerState::NonConnected
            };
            inner.set_state(next, fx);
        });
    }

    /// Persistent channel to this peer, if one is open.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        let mut inner = self.inner.lock();
        match &inner.channel {
            Some(ch) if ch.is_open() => Some(ch.clone()),
            Some(_) => {
                inner.channel = None;
                None
            }
            None => None,
        }
    }

    pub fn set_channel(&self, channel: Arc<Channel>) {
        let previous = self.inner.lock().channel.replace(channel);
        if let Some(previous) = previous {
            previous.close();
        }
    }

    pub fn close_channel(&self) {
        let channel = self.inner.lock().channel.take();
        if let Some(channel) = channel {
            channel.close();
        }
    }

    // ---- metadata ---------------------------------------------------------

    pub fn services(&self) -> Services {
        self.inner.lock().services
    }

    pub fn provides(&self, flag: u64) -> bool {
        self.services().contains(flag)
    }

    /// Replace the announced services, keeping our own view of the hallmark bit.
    /// Returns true when the bitmask changed.
    pub fn set_services(&self, services: Services) -> bool {
        let mut inner = self.inner.lock();
        let hallmark_bit = inner.services.0 & Services::HALLMARK;
        let next = Services((services.0 & !Services::HALLMARK) | hallmark_bit);
        let changed = next != inner.services;
        inner.services = next;
        changed
    }

    pub fn application(&self) -> Option<String> {
        self.inner.lock().application.clone()
    }

    pub fn set_application(&self, application: &str) -> Result<(), PeerError> {
        let application = application.trim();
        if application.len() > MAX_APPLICATION_LENGTH {
            return Err(PeerError::invalid("application", application));
        }
        self.inner.lock().application = Some(application.to_string());
        Ok(())
    }

    pub fn version(&self) -> Option<String> {
        self.inner.lock().version.clone()
    }

    /// Record the peer's version and apply the minimum-version gate.
    /// Returns whether the peer is now flagged as running an old version.
    pub fn set_version(self: &Arc<Self>, version: &str) -> Result<bool, PeerError> {
        let version = version.trim();
        if version.len() > MAX_VERSION_LENGTH {
            return Err(PeerError::invalid("version", version));
        }
        let min = self.shared.min_version.clone();
        let host = self.host.clone();
        Ok(self.apply(|inner, fx| {
            let changed = inner.version.as_deref() != Some(version);
            let was_blacklisted = inner.blacklisting_time > 0 || inner.is_old_version;
            inner.version = Some(version.to_string());
            inner.is_old_version = is_old_version(Some(version), &min);
            if inner.is_old_version {
                if changed {
                    debug!(peer = %host, version, "[PEERS] Blacklisting peer running old version");
                }
                inner.blacklisting_cause = Some(format!("Old version: {version}"));
                inner.last_inbound_request = 0;
                inner.set_state(PeerState::NonConnected, fx);
                if !was_blacklisted {
                    fx.events.push(PeerEvent::Blacklist);
                }
            }
            inner.is_old_version
        }))
    }

    pub fn is_old_version(&self) -> bool {
        self.inner.lock().is_old_version
    }

    pub fn platform(&self) -> Option<String> {
        self.inner.lock().platform.clone()
    }

    pub fn set_platform(&self, platform: &str) -> Result<(), PeerError> {
        let platform = platform.trim();
        if platform.len() > MAX_PLATFORM_LENGTH {
            return Err(PeerError::invalid("platform", platform));
        }
        self.inner.lock().platform = Some(platform.to_string());
        Ok(())
    }

    pub fn share_address(&self) -> bool {
        self.inner.lock().share_address
    }

    pub fn set_share_address(&self, share: bool) {
        self.inner.lock().share_address = share;
    }

    pub fn blockchain_state(&self) -> Option<BlockchainState> {
        self.inner.lock().blockchain_state
    }

    pub fn set_blockchain_state(&self, state: Option<BlockchainState>) {
        self.inner.lock().blockchain_state = state;
    }

    pub fn is_light_client(&self) -> bool {
        self.blockchain_state() == Some(BlockchainState::LightClient)
    }

    // ---- timestamps -------------------------------------------------------

    pub fn last_updated(&self) -> u64 {
        self.inner.lock().last_updated
    }

    pub fn set_last_updated(&self, time: u64) {
        self.inner.lock().last_updated = time;
    }

    pub fn last_connect_attempt(&self) -> u64 {
        self.inner.lock().last_connect_attempt
    }

    /// Stamp a connect attempt with the current time and return it
    pub fn mark_connect_attempt(&self) -> u64 {
        let now = self.now();
        self.inner.lock().last_connect_attempt = now;
        now
    }

    pub fn last_inbound_request(&self) -> u64 {
        self.inner.lock().last_inbound_request
    }

    pub fn set_last_inbound_request(&self, time: u64) {
        self.inner.lock().last_inbound_request = time;
    }

    pub fn is_inbound(&self) -> bool {
        self.last_inbound_request() != 0
    }

    // ---- volume -----------------------------------------------------------

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn add_uploaded(self: &Arc<Self>, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.notify(PeerEvent::UploadedVolume);
    }

    pub fn add_downloaded(self: &Arc<Self>, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.notify(PeerEvent::DownloadedVolume);
    }

    // ---- blacklisting -----------------------------------------------------

    pub fn is_blacklisted(&self) -> bool {
        let inner = self.inner.lock();
        inner.blacklisting_time > 0
            || inner.is_old_version
            || self.shared.known_blacklisted.contains(&self.host)
            || inner
                .announced_address
                .as_ref()
                .is_some_and(|a| self.shared.known_blacklisted.contains(a))
    }

    pub fn blacklisting_cause(&self) -> Option<String> {
        self.inner.lock().blacklisting_cause.clone()
    }

    pub fn blacklisting_time(&self) -> u64 {
        self.inner.lock().blacklisting_time
    }

    /// Blacklist from now on. Repeating it refreshes the time and cause;
    /// the BLACKLIST event fires only when the peer was not blacklisted yet.
    pub fn blacklist(self: &Arc<Self>, cause: impl Into<String>) {
        let cause = cause.into();
        let now = self.now().max(1);
        self.apply(|inner, fx| {
            let already = inner.blacklisting_time > 0 || inner.is_old_version;
            inner.blacklisting_time = now;
            inner.blacklisting_cause = Some(cause);
            inner.set_state(PeerState::NonConnected, fx);
            inner.last_inbound_request = 0;
            if !already {
                fx.events.push(PeerEvent::Blacklist);
            }
        });
    }

    /// Returns false when the peer was not blacklisted.
    pub fn unblacklist(self: &Arc<Self>) -> bool {
        let host = self.host.clone();
        self.apply(|inner, fx| {
            if inner.blacklisting_time == 0 {
                return false;
            }
            debug!(peer = %host, "[PEERS] Unblacklisting");
            inner.set_state(PeerState::NonConnected, fx);
            inner.blacklisting_time = 0;
            inner.blacklisting_cause = None;
            fx.events.push(PeerEvent::Unblacklist);
            true
        })
    }

    /// Expire a blacklisting older than `period` and forget a stale
    /// old-version flag so an upgraded peer gets re-evaluated.
    pub fn update_blacklisted_status(self: &Arc<Self>, now: u64, period: u64) {
        let expired = {
            let inner = self.inner.lock();
            inner.blacklisting_time > 0 && inner.blacklisting_time + period <= now
        };
        if expired {
            self.unblacklist();
        }
        let mut inner = self.inner.lock();
        if inner.is_old_version && inner.last_updated + OLD_VERSION_RESET_SECS < now {
            inner.is_old_version = false;
            if inner.blacklisting_time == 0 {
                inner.blacklisting_cause = None;
            }
        }
    }

    // ---- hallmark and weight ---------------------------------------------

    pub fn hallmark(&self) -> Option<Hallmark> {
        self.inner.lock().hallmark.clone()
    }

    pub(crate) fn set_hallmark(&self, hallmark: Option<Hallmark>) {
        self.inner.lock().set_hallmark(hallmark);
    }

    /// Hallmark weight counted toward a group renormalisation at `date`
    pub(crate) fn hallmark_weight_at(&self, date: u32) -> u64 {
        match &self.inner.lock().hallmark {
            Some(h) if h.is_valid() && h.date() == date => u64::from(h.weight()),
            _ => 0,
        }
    }

    pub fn adjusted_weight(&self) -> u64 {
        self.inner.lock().adjusted_weight
    }

    pub(crate) fn set_adjusted_weight(&self, weight: u64) {
        self.inner.lock().adjusted_weight = weight;
    }

    /// `adjusted_weight * whole-unit balance / MAX_BALANCE`; zero without a hallmark.
    pub fn weight(&self, chain: &dyn Blockchain) -> u64 {
        let height = chain.height();
        let refresh = {
            let inner = self.inner.lock();
            let Some(hallmark) = &inner.hallmark else {
                return 0;
            };
            let stale = inner.hallmark_balance.is_none()
                || inner.hallmark_balance_height + BALANCE_REFRESH_BLOCKS < height;
            stale.then(|| hallmark.account_id())
        };
        if let Some(account) = refresh {
            let balance = chain.account_balance(account);
            let mut inner = self.inner.lock();
            inner.hallmark_balance = Some(balance);
            inner.hallmark_balance_height = height;
        }
        let inner = self.inner.lock();
        let balance = inner.hallmark_balance.unwrap_or(0).max(0) as u64;
        let weight =
            u128::from(inner.adjusted_weight) * u128::from(balance / ONE_UNIT) / u128::from(MAX_BALANCE);
        weight.min(u128::from(u64::MAX)) as u64
    }

    pub fn rank(&self, chain: &dyn Blockchain) -> PeerRank {
        PeerRank {
            weight: self.weight(chain),
            host: self.host.clone(),
        }
    }
}

/// Total order used to trim the pool: heavier peers first, then by host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRank {
    pub weight: u64,
    pub host: String,
}

impl Ord for PeerRank {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .weight
            .cmp(&self.weight)
            .then_with(|| self.host.cmp(&other.host))
    }
}

impl PartialOrd for PeerRank {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
