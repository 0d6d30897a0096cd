//! The peer network: owns the address book, reputation, transport and
//! background tasks, and implements outbound connect/send.

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::address::{address_with_port, parse_address, Resolver};
use super::address_book::AddressBook;
use super::error::PeerError;
use super::hallmark::Hallmark;
use super::handlers::my_peer_info;
use super::peer::{Peer, PeerEvent, PeerEvents, PeerShared, PeerState, Services};
use super::peer_store::{PeerStore, SavedPeer};
use super::reputation::Reputation;
use super::router::{RequestRouter, GET_INFO, PROTOCOL, SEQUENCE_ERROR};
use super::scheduler::{self, Scheduler};
use super::selection::pick_weighted;
use super::server;
use super::transport::{Channel, InboundRequest, Transport};
use crate::chain::{Blockchain, TransactionPool};
use crate::clock::Clock;
use crate::config::NetworkConfig;
use crate::metrics::NetworkMetrics;

/// Saved peers older than this are dropped from the peer table
const SAVE_MAX_AGE_SECS: u64 = 7 * 24 * 3600;
/// Discovered peers not heard of for this long get their timestamp refreshed
const STALE_PEER_SECS: u64 = 24 * 3600;
const MAX_RELOCATIONS: usize = 3;

/// The node-side services this network depends on.
pub struct Collaborators {
    pub chain: Arc<dyn Blockchain>,
    pub pool: Arc<dyn TransactionPool>,
    pub clock: Arc<dyn Clock>,
    pub resolver: Arc<dyn Resolver>,
    pub store: Option<PeerStore>,
}

pub struct Network {
    config: NetworkConfig,
    my_address: Option<String>,
    my_hallmark: Option<String>,
    my_services: Services,
    clock: Arc<dyn Clock>,
    book: Arc<AddressBook>,
    reputation: Arc<Reputation>,
    router: RequestRouter,
    transport: Transport,
    chain: Arc<dyn Blockchain>,
    pool: Arc<dyn TransactionPool>,
    metrics: Arc<NetworkMetrics>,
    store: Option<PeerStore>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<InboundRequest>>>,
    inbound: DashMap<u64, Arc<Channel>>,
    scheduler: Scheduler,
    stop: watch::Sender<bool>,
}

/// Run `f` on the blocking pool, or inline when called outside a runtime.
pub fn run_blocking<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(f);
        }
        Err(_) => f(),
    }
}

impl Network {
    /// Wire every component together. Nothing runs until [`start`](Self::start).
    pub fn new(config: NetworkConfig, parts: Collaborators) -> anyhow::Result<Arc<Self>> {
        let default_port = config.default_peer_port();
        let shared = Arc::new(PeerShared {
            events: PeerEvents::new(),
            clock: parts.clock.clone(),
            known_blacklisted: config
                .known_blacklisted_peers
                .iter()
                .map(|p| p.trim().to_ascii_lowercase())
                .collect(),
            default_port,
            min_version: config.min_version_parts(),
        });
        let book = Arc::new(AddressBook::new(&config, shared.clone(), parts.resolver));
        let reputation = Arc::new(Reputation::new(&config, book.clone(), parts.chain.clone()));
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_queue.max(1));
        let transport = Transport::new(&config, dispatch_tx)?;
        let metrics = Arc::new(NetworkMetrics::new()?);
        metrics.attach(&shared.events);

        let my_hallmark = config.hallmark.as_deref().and_then(|encoded| {
            match Hallmark::parse(encoded, default_port) {
                Ok(h) if h.is_valid() => Some(encoded.trim().to_ascii_lowercase()),
                Ok(_) => {
                    warn!("[PEERS] Configured hallmark has a bad signature, not announcing it");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "[PEERS] Configured hallmark is malformed, not announcing it");
                    None
                }
            }
        });
        let mut my_services = Services::default();
        if my_hallmark.is_some() {
            my_services = my_services.with(Services::HALLMARK);
        }
        if config.include_expired_prunable {
            my_services = my_services.with(Services::PRUNABLE);
        }
        let (stop, _) = watch::channel(false);

        Ok(Arc::new(Self {
            my_address: config
                .my_address
                .as_deref()
                .and_then(|a| address_with_port(a, default_port)),
            my_hallmark,
            my_services,
            clock: parts.clock,
            book,
            reputation,
            router: RequestRouter::new(),
            transport,
            chain: parts.chain,
            pool: parts.pool,
            metrics,
            store: parts.store,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            inbound: DashMap::new(),
            scheduler: Scheduler::new(),
            stop,
            config,
        }))
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn book(&self) -> &Arc<AddressBook> {
        &self.book
    }

    pub fn reputation(&self) -> &Arc<Reputation> {
        &self.reputation
    }

    pub fn events(&self) -> &PeerEvents {
        &self.book.shared().events
    }

    pub fn chain(&self) -> &Arc<dyn Blockchain> {
        &self.chain
    }

    pub fn pool(&self) -> &Arc<dyn TransactionPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<NetworkMetrics> {
        &self.metrics
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Our own announced address, normalised
    pub fn announced_address(&self) -> Option<String> {
        self.my_address.clone()
    }

    pub fn my_hallmark(&self) -> Option<&str> {
        self.my_hallmark.as_deref()
    }

    pub fn my_services(&self) -> Services {
        self.my_services
    }

    pub fn normalize_address(&self, address: &str) -> Option<String> {
        address_with_port(address, self.book.default_port())
    }

    // ---- inbound ------------------------------------------------------------

    /// Route one request from `host` and account its bytes to the peer.
    pub fn process_request(self: &Arc<Self>, host: &str, body: &[u8]) -> Vec<u8> {
        let (response, peer) = self.router.process(self, host, body);
        let bytes = serde_json::to_vec(&response)
            .unwrap_or_else(|_| br#"{"error":"internal error"}"#.to_vec());
        if let Some(peer) = peer {
            peer.add_downloaded(body.len() as u64);
            peer.add_uploaded(bytes.len() as u64);
        }
        bytes
    }

    pub(crate) fn register_inbound(&self, channel: Arc<Channel>) {
        debug!(peer = %channel.remote(), channel = channel.id(), "[CHANNEL] Accepted inbound channel");
        self.inbound.insert(channel.id(), channel);
    }

    pub(crate) fn prune_inbound_channels(&self) {
        self.inbound.retain(|_, ch| ch.is_open());
    }

    pub fn inbound_channel_count(&self) -> usize {
        self.inbound.iter().filter(|ch| ch.is_open()).count()
    }

    // ---- outbound -----------------------------------------------------------

    pub async fn send(self: &Arc<Self>, peer: &Arc<Peer>, request: Map<String, Value>) -> Option<Value> {
        self.send_with_limit(peer, request, self.config.max_response_size)
            .await
    }

    /// Send one request and return the peer's JSON response. Failures are
    /// applied to the peer here and surface to the caller only as None.
    pub async fn send_with_limit(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        mut request: Map<String, Value>,
        max_response: usize,
    ) -> Option<Value> {
        request.insert("protocol".into(), json!(PROTOCOL));
        let request_type = request
            .get("requestType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "[PEERS] Cannot encode request");
                return None;
            }
        };
        let sent = body.len() as u64;

        let bytes = match self.transport.exchange(peer, body, max_response).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.is_blacklist_worthy() {
                    self.reputation.blacklist(peer, &e.to_string());
                } else if e.is_benign() {
                    debug!(peer = %peer.host(), request_type, error = %e, "[PEERS] Send failed");
                    peer.transport_failed();
                } else {
                    debug!(peer = %peer.host(), request_type, error = %e, "[PEERS] Send failed, deactivating");
                    peer.deactivate();
                }
                return None;
            }
        };
        peer.add_uploaded(sent);
        peer.add_downloaded(bytes.len() as u64);

        let response = match serde_json::from_slice::<Value>(&bytes) {
            Ok(v @ Value::Object(_)) => v,
            Ok(_) | Err(_) => {
                debug!(peer = %peer.host(), request_type, "[PEERS] Unparseable response");
                peer.deactivate();
                return None;
            }
        };
        if let Some(error) = response.get("error") {
            debug!(peer = %peer.host(), request_type, error = %error, "[PEERS] Peer responded with error");
            peer.deactivate();
            if error.as_str() == Some(SEQUENCE_ERROR) && request_type != GET_INFO {
                debug!(peer = %peer.host(), "[PEERS] Peer lost our handshake, reconnecting");
                tokio::spawn(self.clone().connect_boxed(peer.clone()));
            }
        }
        Some(response)
    }

    pub fn connect_boxed(self: Arc<Self>, peer: Arc<Peer>) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.connect(peer).await })
    }

    /// Handshake with `peer`. A peer whose announced address now resolves
    /// elsewhere is replaced by a record for the new IP, which is connected
    /// instead.
    pub async fn connect(self: &Arc<Self>, peer: Arc<Peer>) {
        let mut peer = peer;
        for _ in 0..MAX_RELOCATIONS {
            match self.connect_once(&peer).await {
                Some(moved) => peer = moved,
                None => return,
            }
        }
    }

    async fn connect_once(self: &Arc<Self>, peer: &Arc<Peer>) -> Option<Arc<Peer>> {
        let _connecting = peer.connect_lock().lock().await;
        peer.mark_connect_attempt();

        if let Some(announced) = peer.announced_address() {
            let net = self.clone();
            let p = peer.clone();
            let moved = tokio::task::spawn_blocking(move || net.relocate(&p, &announced))
                .await
                .ok()
                .flatten();
            if moved.is_some() {
                return moved;
            }
        }

        let mut request = my_peer_info(self);
        request.insert("requestType".into(), json!(GET_INFO));
        let Some(response) = self.send(peer, request).await else {
            peer.set_state(PeerState::NonConnected);
            return None;
        };
        let net = self.clone();
        let p = peer.clone();
        let _ = tokio::task::spawn_blocking(move || net.apply_handshake(&p, &response)).await;
        None
    }

    fn relocate(&self, peer: &Arc<Peer>, announced: &str) -> Option<Arc<Peer>> {
        let parsed = parse_address(announced)?;
        let current: IpAddr = peer.host().parse().ok()?;
        let ips = self.book.resolve(&parsed.host).ok()?;
        if ips.contains(&current) {
            return None;
        }
        let new_ip = *ips.first()?;
        info!(
            peer = %peer.host(),
            announced,
            new_ip = %new_ip,
            "[PEERS] Announced address moved to a new IP"
        );
        self.book.remove(peer);
        self.book
            .find_or_create_ip(new_ip, Some(announced.to_string()), true)
            .map(|(moved, _)| moved)
    }

    fn apply_handshake(&self, peer: &Arc<Peer>, response: &Value) {
        if response.get("error").is_some() {
            peer.set_state(PeerState::NonConnected);
            return;
        }
        let services_changed = peer.set_services(Services::from_wire(response.get("services")));
        let metadata: Result<(), PeerError> = peer
            .set_application(text_field(response, "application"))
            .and_then(|_| peer.set_version(text_field(response, "version")).map(|_| ()))
            .and_then(|_| peer.set_platform(text_field(response, "platform")));
        if let Err(e) = metadata {
            self.reputation.blacklist_for(peer, &e);
            return;
        }
        peer.set_share_address(response.get("shareAddress").and_then(Value::as_bool) == Some(true));
        peer.set_last_updated(self.now());
        peer.set_blockchain_state(
            response
                .get("blockchainState")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
        );
        self.reputation
            .analyze_hallmark(peer, response.get("hallmark").and_then(Value::as_str));

        let current = peer.announced_address();
        let announced = response
            .get("announcedAddress")
            .and_then(Value::as_str)
            .and_then(|a| self.normalize_address(a))
            .filter(|a| Some(a) != current.as_ref());
        if let Some(announced) = announced {
            if !self.reputation.verify_announced_address(peer, &announced) {
                debug!(peer = %peer.host(), announced, "[PEERS] Connect: announced address does not match peer");
                let old_valid = current
                    .as_deref()
                    .is_some_and(|old| self.reputation.verify_announced_address(peer, old));
                if !old_valid {
                    self.fall_back_to_host(peer);
                }
                peer.set_state(PeerState::NonConnected);
                return;
            }
            let old_port = peer.port();
            if let Err(e) = self.book.set_announced_address(peer, &announced) {
                self.reputation.blacklist_for(peer, &e);
                return;
            }
            if peer.port() != old_port {
                peer.set_state(PeerState::NonConnected);
                return;
            }
        }
        if peer.announced_address().is_none() {
            let default_port = self.book.default_port();
            if peer.hallmark().map_or(true, |h| h.port() == default_port) {
                self.fall_back_to_host(peer);
            } else {
                peer.set_state(PeerState::NonConnected);
                return;
            }
        }

        if !peer.is_old_version() {
            peer.set_state(PeerState::Connected);
            if services_changed {
                peer.notify(PeerEvent::ChangedServices);
            }
        }
    }

    fn fall_back_to_host(&self, peer: &Arc<Peer>) {
        if let Err(e) = self.book.set_announced_address(peer, peer.host()) {
            debug!(peer = %peer.host(), error = %e, "[PEERS] Cannot use host as announced address");
        }
    }

    /// Merge announced addresses learned from a peer. Returns the addresses
    /// that map to a usable peer.
    pub fn merge_addresses(&self, entries: &[(String, Option<Services>)]) -> Vec<String> {
        let now = self.now();
        let mut merged = Vec::new();
        for (address, services) in entries {
            let Some((peer, created)) = self.book.select_or_create_entry(address, true) else {
                continue;
            };
            if now.saturating_sub(peer.last_updated()) > STALE_PEER_SECS {
                peer.set_last_updated(now);
            }
            if created {
                if let Some(services) = services {
                    peer.set_services(*services);
                }
            }
            merged.push(address.clone());
            if self.book.too_many() {
                break;
            }
        }
        merged
    }

    // ---- selection ----------------------------------------------------------

    /// Random non-blacklisted peer in `state` with an announced address,
    /// skewed toward weight when hallmark protection is on.
    pub fn any_peer(&self, state: PeerState, apply_pull_threshold: bool) -> Option<Arc<Peer>> {
        let protection = self.config.enable_hallmark_protection;
        let candidates: Vec<(Arc<Peer>, u64)> = self
            .book
            .filter(|p| !p.is_blacklisted() && p.state() == state && p.announced_address().is_some())
            .into_iter()
            .map(|p| {
                let weight = self.reputation.weight(&p);
                (p, weight)
            })
            .filter(|(_, w)| !apply_pull_threshold || !protection || *w >= self.config.pull_threshold)
            .collect();
        pick_weighted(&candidates, protection, &mut rand::thread_rng()).cloned()
    }

    pub fn has_enough_connected_public_peers(&self, limit: usize) -> bool {
        let protection = self.config.enable_hallmark_protection;
        self.book.count_up_to(limit, |p| {
            p.state() == PeerState::Connected
                && p.announced_address().is_some()
                && (!protection || self.reputation.weight(p) > 0)
        }) >= limit
    }

    pub fn has_too_many_outbound_connections(&self) -> bool {
        let limit = self.config.max_outbound_connections;
        self.book.count_up_to(limit, |p| {
            !p.is_blacklisted() && p.state() == PeerState::Connected && p.announced_address().is_some()
        }) >= limit
    }

    // ---- persistence --------------------------------------------------------

    /// Seed the book from well-known peers and the saved peer table.
    pub fn load_peers(&self) -> usize {
        let mut loaded = 0;
        for address in &self.config.well_known_peers {
            if self.book.select_or_create(address, true).is_some() {
                loaded += 1;
            }
        }
        if let Some(store) = &self.store {
            for saved in store.load() {
                let Some(peer) = self.book.select_or_create(&saved.address, true) else {
                    continue;
                };
                peer.set_services(Services(saved.services));
                if peer.last_updated() < saved.last_updated {
                    peer.set_last_updated(saved.last_updated);
                }
                loaded += 1;
            }
        }
        info!(loaded, known = self.book.size(), "[PEERS] Loaded initial peers");
        loaded
    }

    /// Rewrite the peer table from the current book.
    pub fn save_peers(&self) -> anyhow::Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let now = self.now();
        let mut seen = HashSet::new();
        let peers: Vec<SavedPeer> = self
            .book
            .all()
            .iter()
            .filter(|p| !p.is_blacklisted() && p.last_updated() + SAVE_MAX_AGE_SECS > now)
            .filter_map(|p| {
                p.announced_address().map(|address| SavedPeer {
                    address,
                    services: p.services().0,
                    last_updated: p.last_updated(),
                })
            })
            .filter(|p| seen.insert(p.address.clone()))
            .collect();
        store.replace_all(&peers)?;
        Ok(())
    }

    // ---- lifecycle ----------------------------------------------------------

    /// Serve peers on `listener` and start the dispatch pool and the
    /// periodic tasks. Returns the bound address.
    pub async fn start(self: &Arc<Self>, listener: TcpListener) -> anyhow::Result<SocketAddr> {
        let local = listener.local_addr()?;
        let rx = self
            .dispatch_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("network already started"))?;
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker in 0..self.config.dispatch_workers.max(1) {
            let net = self.clone();
            let rx = rx.clone();
            self.scheduler
                .spawn("dispatch", async move { net.dispatch_worker(worker, rx).await });
        }

        let app = server::router(self.clone());
        let mut stop = self.stop.subscribe();
        self.scheduler.spawn("server", async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = stop.wait_for(|stopped| *stopped).await;
            })
            .await;
            if let Err(e) = served {
                warn!(error = %e, "[PEERS] Peer server stopped with error");
            }
        });

        let net = self.clone();
        self.scheduler.spawn("load peers", async move {
            let loader = net.clone();
            let _ = tokio::task::spawn_blocking(move || loader.load_peers()).await;
        });
        scheduler::start_periodic_tasks(self);

        info!(address = %local, "[PEERS] Peer networking started");
        Ok(local)
    }

    async fn dispatch_worker(
        self: Arc<Self>,
        worker: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<InboundRequest>>>,
    ) {
        loop {
            let next = { rx.lock().await.recv().await };
            let Some(request) = next else {
                debug!(worker, "[CHANNEL] Dispatch queue closed");
                return;
            };
            let net = self.clone();
            let host = request.channel.remote().to_string();
            let payload = request.payload;
            let response =
                match tokio::task::spawn_blocking(move || net.process_request(&host, &payload)).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "[CHANNEL] Request processing failed");
                        continue;
                    }
                };
            if let Err(e) = request.channel.respond(request.id, &response).await {
                debug!(peer = %request.channel.remote(), error = %e, "[CHANNEL] Cannot answer request");
            }
        }
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Stop every task, the server and all channels; save peers if enabled.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        self.scheduler.shutdown();
        for channel in self.inbound.iter() {
            channel.close();
        }
        self.inbound.clear();
        for peer in self.book.all() {
            peer.close_channel();
        }
        if self.config.save_peers {
            if let Err(e) = self.save_peers() {
                warn!(error = %e, "[PEER STORE] Failed to save peers on shutdown");
            }
        }
        // give the server a moment to drain in-flight requests
        tokio::time::sleep(Duration::from_millis(50)).await;
        info!("[PEERS] Peer networking stopped");
    }
}

/// Trimmed string field, "?" when missing or blank
fn text_field<'a>(message: &'a Value, name: &str) -> &'a str {
    message
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::NetworkConfig;
    use crate::p2p::address::StaticResolver;
    use crate::p2p::error::TransportError;
    use crate::p2p::test_utils::{
        fake_peer, handshake_reply, request_types, test_config, test_network, test_network_with,
    };
    use std::sync::atomic::{AtomicU8, Ordering};

    /// Resolves every name to a fresh address, as if the host kept moving.
    struct MovingResolver {
        next: AtomicU8,
    }

    impl Resolver for MovingResolver {
        fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, TransportError> {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(vec![ip]);
            }
            let last = self.next.fetch_add(1, Ordering::SeqCst);
            Ok(vec![IpAddr::from([198, 51, 100, 10 + last])])
        }
    }

    #[test]
    fn merge_refreshes_stale_timestamps_and_respects_cap() {
        let config = NetworkConfig {
            max_known_peers: 2,
            min_known_peers: 1,
            ..test_config()
        };
        let t = test_network(config, 1, StaticResolver::new());
        let entries: Vec<(String, Option<Services>)> = (1..=5)
            .map(|i| (format!("198.51.100.{i}"), Some(Services(4))))
            .collect();
        let merged = t.net.merge_addresses(&entries);
        // stops once the book holds more than the maximum
        assert_eq!(merged.len(), 3);
        let p = t.net.book().get("198.51.100.1").unwrap();
        assert_eq!(p.last_updated(), t.clock.now());
        assert_eq!(p.services(), Services(4));
    }

    #[test]
    fn save_and_load_round_trip_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let clock = Arc::new(ManualClock::new(10_000_000));
        let make = |store| {
            Network::new(
                NetworkConfig {
                    well_known_peers: vec!["198.51.100.50".into()],
                    ..test_config()
                },
                Collaborators {
                    chain: Arc::new(crate::chain::MemoryChain::new()),
                    pool: Arc::new(crate::chain::MemoryPool::new()),
                    clock: clock.clone(),
                    resolver: Arc::new(StaticResolver::new()),
                    store: Some(store),
                },
            )
            .unwrap()
        };

        let first = make(PeerStore::open(&db).unwrap());
        let fresh = first.book().select_or_create("198.51.100.1:9000", true).unwrap();
        fresh.set_last_updated(clock.now() - 10);
        fresh.set_services(Services(4));
        let old = first.book().select_or_create("198.51.100.2", true).unwrap();
        old.set_last_updated(clock.now() - SAVE_MAX_AGE_SECS - 1);
        let bad = first.book().select_or_create("198.51.100.3", true).unwrap();
        bad.set_last_updated(clock.now());
        bad.blacklist("spam");
        first.save_peers().unwrap();

        let second = make(PeerStore::open(&db).unwrap());
        assert_eq!(second.load_peers(), 2);
        let restored = second.book().get("198.51.100.1").unwrap();
        assert_eq!(restored.port(), 9000);
        assert_eq!(restored.services(), Services(4));
        assert_eq!(restored.last_updated(), clock.now() - 10);
        assert!(second.book().get("198.51.100.50").is_some());
        assert!(second.book().get("198.51.100.2").is_none());
        assert!(second.book().get("198.51.100.3").is_none());
    }

    #[test]
    fn invalid_own_hallmark_is_not_announced() {
        let t = test_network(
            NetworkConfig {
                hallmark: Some("deadbeef".into()),
                ..test_config()
            },
            1,
            StaticResolver::new(),
        );
        assert!(t.net.my_hallmark().is_none());
        assert!(!t.net.my_services().contains(Services::HALLMARK));
    }

    #[test]
    fn any_peer_only_picks_matching_state() {
        let t = test_network(test_config(), 1, StaticResolver::new());
        assert!(t.net.any_peer(PeerState::Connected, true).is_none());
        let a = t.net.book().select_or_create("198.51.100.1", true).unwrap();
        t.net.book().select_or_create("198.51.100.2", true).unwrap();
        a.set_state(PeerState::Connected);
        for _ in 0..20 {
            let picked = t.net.any_peer(PeerState::Connected, false).unwrap();
            assert!(Arc::ptr_eq(&picked, &a));
        }
    }

    #[tokio::test]
    async fn failed_handshake_leaves_peer_non_connected() {
        // nothing listens on port 9 of a TEST-NET address; connect fails fast or times out
        let t = test_network(
            NetworkConfig {
                use_persistent_channels: false,
                connect_timeout_ms: 200,
                read_timeout_ms: 200,
                ..test_config()
            },
            1,
            StaticResolver::new(),
        );
        let peer = t.net.book().select_or_create("127.0.0.1:9", false);
        assert!(peer.is_none());
        let peer = t.net.book().select_or_create("192.0.2.1:9", true).unwrap();
        t.net.connect(peer.clone()).await;
        assert_eq!(peer.state(), PeerState::NonConnected);
        assert!(!peer.is_blacklisted());
        assert!(peer.last_connect_attempt() > 0);
    }

    #[tokio::test]
    async fn relocation_is_followed_at_most_three_times() {
        let resolver = Arc::new(MovingResolver {
            next: AtomicU8::new(0),
        });
        let t = test_network_with(test_config(), 1, resolver.clone());
        let (peer, _) = t
            .net
            .book()
            .find_or_create_ip("198.51.100.1".parse().unwrap(), Some("node.example".into()), true)
            .unwrap();

        t.net.connect(peer).await;

        assert_eq!(resolver.next.load(Ordering::SeqCst), MAX_RELOCATIONS as u8);
        assert_eq!(t.net.book().size(), 1);
        assert!(t.net.book().get("198.51.100.1").is_none());
        let last = t.net.book().get("198.51.100.12").unwrap();
        assert_eq!(last.announced_address().as_deref(), Some("node.example"));
        // the final hop is left for the next connect pass
        assert_eq!(last.last_connect_attempt(), 0);
    }

    #[tokio::test]
    async fn sequence_error_triggers_a_fresh_handshake() {
        fn forgetful(request: &Value) -> Value {
            if request["requestType"] == GET_INFO {
                handshake_reply(request)
            } else {
                json!({ "error": SEQUENCE_ERROR })
            }
        }
        let (port, seen) = fake_peer("127.0.0.1", forgetful).await;
        let t = test_network(
            NetworkConfig {
                local_test_mode: true,
                use_persistent_channels: false,
                ..test_config()
            },
            1,
            StaticResolver::new(),
        );
        let peer = t
            .net
            .book()
            .select_or_create(&format!("127.0.0.1:{port}"), true)
            .unwrap();
        t.net.connect(peer.clone()).await;
        assert_eq!(peer.state(), PeerState::Connected);

        let mut request = Map::new();
        request.insert("requestType".into(), json!("getPeers"));
        let response = t.net.send(&peer, request).await.unwrap();
        assert_eq!(response["error"], SEQUENCE_ERROR);

        let mut handshakes = 0;
        for _ in 0..100 {
            handshakes = request_types(&seen).iter().filter(|r| *r == GET_INFO).count();
            if handshakes == 2 && peer.state() == PeerState::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handshakes, 2);
        assert_eq!(peer.state(), PeerState::Connected);
        assert!(!peer.is_blacklisted());
    }
}
