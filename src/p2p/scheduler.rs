//! Background tasks: named periodic jobs that keep the peer pool healthy.
//!
//! A panic inside a periodic job is treated as fatal. The node logs it and
//! exits instead of silently losing the job.

use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::handlers::{address_entries, shareable, MAX_PEERS_PER_RESPONSE};
use super::network::Network;
use super::peer::{Peer, PeerEvent, PeerState, Services};
use super::selection::pick_connect_set;

/// Peers whose last attempt is more recent than this are not retried
const RECONNECT_AFTER_SECS: u64 = 600;
/// Connected peers silent for this long are re-handshaken
const REFRESH_AFTER_SECS: u64 = 3600;
const STALE_PEER_SECS: u64 = 24 * 3600;
const CONNECT_BATCH: usize = 10;

#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.push((name, handle));
    }

    /// Run `job` every `period`, first after one full period.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(100));
        self.spawn(name, async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if AssertUnwindSafe(job()).catch_unwind().await.is_err() {
                    error!(task = name, "[SCHEDULER] CRITICAL ERROR in periodic task. PLEASE REPORT. Shutting down");
                    std::process::exit(1);
                }
            }
        });
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn shutdown(&self) {
        for (name, handle) in self.tasks.lock().drain(..) {
            debug!(task = name, "[SCHEDULER] Stopping task");
            handle.abort();
        }
    }
}

pub(crate) fn start_periodic_tasks(net: &Arc<Network>) {
    let config = net.config();
    let scheduler = net.scheduler();

    let n = net.clone();
    scheduler.spawn_periodic(
        "peer connecting",
        Duration::from_secs(config.connect_interval_secs),
        move || {
            let n = n.clone();
            async move { connect_peers(&n).await }
        },
    );

    let n = net.clone();
    scheduler.spawn_periodic(
        "peer unblacklisting",
        Duration::from_secs(config.unblacklist_interval_secs),
        move || {
            let n = n.clone();
            async move { n.reputation().sweep(n.now()) }
        },
    );

    if config.get_more_peers {
        let n = net.clone();
        scheduler.spawn_periodic(
            "get more peers",
            Duration::from_secs(config.discovery_interval_secs),
            move || {
                let n = n.clone();
                async move { discover_peers(&n).await }
            },
        );
    }

    if config.save_peers {
        let n = net.clone();
        scheduler.spawn_periodic(
            "save peers",
            Duration::from_secs(config.save_interval_secs),
            move || {
                let n = n.clone();
                async move {
                    let saver = n.clone();
                    match tokio::task::spawn_blocking(move || saver.save_peers()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(error = %e, "[PEER STORE] Failed to save peers"),
                        Err(e) => error!(error = %e, "[PEER STORE] Save task failed"),
                    }
                }
            },
        );
    }

    info!(tasks = ?scheduler.task_names(), "[SCHEDULER] Periodic tasks started");
}

/// One pass of the connection keeper.
pub(crate) async fn connect_peers(net: &Arc<Network>) {
    let now = net.now();
    let config = net.config();
    let max_public = config.max_connected_public_peers;

    if !net.has_enough_connected_public_peers(max_public) {
        let needs_connect = |p: &Peer| {
            !p.is_blacklisted()
                && p.announced_address().is_some()
                && p.state() != PeerState::Connected
                && now.saturating_sub(p.last_connect_attempt()) > RECONNECT_AFTER_SECS
        };
        let hallmarked = net
            .book()
            .filter(|p| needs_connect(p) && p.provides(Services::HALLMARK));
        let plain = net
            .book()
            .filter(|p| needs_connect(p) && !p.provides(Services::HALLMARK));
        let picked = {
            let mut rng = rand::thread_rng();
            pick_connect_set(&hallmarked, &plain, CONNECT_BATCH, &mut rng)
        };
        if !picked.is_empty() {
            debug!(count = picked.len(), "[GOSSIP] Connecting to peers");
        }
        join_all(picked.into_iter().map(|peer| {
            let net = net.clone();
            async move {
                net.connect(peer.clone()).await;
                if peer.state() == PeerState::Connected
                    && net.config().enable_hallmark_protection
                    && net.reputation().weight(&peer) == 0
                    && net.has_too_many_outbound_connections()
                {
                    debug!(peer = %peer.host(), "[GOSSIP] Too many outbound connections, dropping unweighted peer");
                    peer.deactivate();
                }
            }
        }))
        .await;
    }

    let idle_timeout = config.inbound_idle_timeout_secs;
    let mut refresh = Vec::new();
    for peer in net.book().all() {
        if peer.state() == PeerState::Connected
            && now.saturating_sub(peer.last_updated()) > REFRESH_AFTER_SECS
            && now.saturating_sub(peer.last_connect_attempt()) > RECONNECT_AFTER_SECS
        {
            refresh.push(peer.clone());
        }
        let last_inbound = peer.last_inbound_request();
        if last_inbound != 0 && now.saturating_sub(last_inbound) > idle_timeout {
            peer.set_last_inbound_request(0);
            peer.notify(PeerEvent::RemoveInbound);
        }
    }
    for peer in refresh {
        tokio::spawn(net.clone().connect_boxed(peer));
    }

    let trimmer = net.clone();
    let due = tokio::task::spawn_blocking(move || {
        trim_pool(&trimmer, now);
        stale_well_known(&trimmer, now)
    })
    .await
    .unwrap_or_default();
    for peer in due {
        tokio::spawn(net.clone().connect_boxed(peer));
    }
    net.prune_inbound_channels();
}

/// Shrink an oversized pool: stale peers go first, then the lowest ranked
/// beyond the minimum pool size.
pub(crate) fn trim_pool(net: &Network, now: u64) {
    let book = net.book();
    if !book.too_many() || !net.has_enough_connected_public_peers(net.config().max_connected_public_peers) {
        return;
    }
    for peer in book.all() {
        if now.saturating_sub(peer.last_updated()) > STALE_PEER_SECS {
            book.remove(&peer);
            if book.too_few() {
                break;
            }
        }
    }
    if book.too_many() {
        let chain = net.chain();
        let mut ranked: Vec<_> = book
            .all()
            .into_iter()
            .map(|p| (p.rank(chain.as_ref()), p))
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0));
        let min_known = book.min_known();
        for (_, peer) in ranked.into_iter().skip(min_known) {
            book.remove(&peer);
        }
        debug!(known = book.size(), "[GOSSIP] Trimmed peer pool");
    }
}

/// Well-known peers due for a reconnect. Any that dropped out of the book are
/// added back first.
fn stale_well_known(net: &Network, now: u64) -> Vec<Arc<Peer>> {
    let mut due = Vec::new();
    for address in &net.config().well_known_peers {
        let Some((peer, created)) = net.book().select_or_create_entry(address, true) else {
            continue;
        };
        if created {
            debug!(peer = %peer.host(), "[GOSSIP] Restored well-known peer");
        }
        if !peer.is_blacklisted()
            && peer.state() != PeerState::Connected
            && now.saturating_sub(peer.last_connect_attempt()) > RECONNECT_AFTER_SECS
        {
            due.push(peer);
        }
    }
    due
}

/// Ask one random connected peer for more addresses, then send it ours.
pub(crate) async fn discover_peers(net: &Arc<Network>) {
    if net.book().too_many() {
        return;
    }
    let Some(peer) = net.any_peer(PeerState::Connected, true) else {
        return;
    };
    exchange_peers(net, &peer).await;
}

/// One getPeers/addPeers round with `peer`.
pub(crate) async fn exchange_peers(net: &Arc<Network>, peer: &Arc<Peer>) {
    let mut request = Map::new();
    request.insert("requestType".into(), json!("getPeers"));
    let max_message = net.config().max_message_size;
    let Some(response) = net.send_with_limit(peer, request, max_message).await else {
        return;
    };
    if response.get("error").is_some() {
        return;
    }

    let entries = address_entries(&response);
    let merger = net.clone();
    let merged = tokio::task::spawn_blocking(move || merger.merge_addresses(&entries))
        .await
        .unwrap_or_default();
    debug!(peer = %peer.host(), merged = merged.len(), "[GOSSIP] Merged peer addresses");

    let received: HashSet<String> = merged.into_iter().collect();
    let theirs = peer.announced_address();
    let mut addresses = Vec::new();
    let mut services = Vec::new();
    for p in net.book().filter(shareable) {
        if addresses.len() >= MAX_PEERS_PER_RESPONSE {
            break;
        }
        let Some(address) = p.announced_address() else {
            continue;
        };
        if received.contains(&address) || theirs.as_ref() == Some(&address) {
            continue;
        }
        addresses.push(Value::String(address));
        services.push(Value::String(p.services().to_wire()));
    }
    if addresses.is_empty() {
        return;
    }
    let mut request = Map::new();
    request.insert("requestType".into(), json!("addPeers"));
    request.insert("peers".into(), Value::Array(addresses));
    request.insert("services".into(), Value::Array(services));
    net.send(peer, request).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::NetworkConfig;
    use crate::p2p::address::StaticResolver;
    use crate::p2p::test_utils::{fake_peer, handshake_reply, request_types, test_config, test_network};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn local_config() -> NetworkConfig {
        NetworkConfig {
            local_test_mode: true,
            use_persistent_channels: false,
            ..test_config()
        }
    }

    #[test]
    fn trim_drops_stale_then_lowest_ranked() {
        let config = NetworkConfig {
            min_known_peers: 3,
            max_known_peers: 5,
            max_connected_public_peers: 1,
            enable_hallmark_protection: false,
            ..test_config()
        };
        let t = test_network(config, 10, StaticResolver::new());
        let now = t.clock.now();
        let mut peers = Vec::new();
        for i in 1..=8 {
            let p = t
                .net
                .book()
                .select_or_create(&format!("198.51.100.{i}"), true)
                .unwrap();
            p.set_last_updated(now);
            peers.push(p);
        }
        peers[0].set_state(PeerState::Connected);
        peers[7].set_last_updated(now - STALE_PEER_SECS - 1);

        trim_pool(&t.net, now);
        assert!(t.net.book().get("198.51.100.8").is_none(), "stale peer goes first");
        assert_eq!(t.net.book().size(), 3);
        // equal weights fall back to host order
        for host in ["198.51.100.1", "198.51.100.2", "198.51.100.3"] {
            assert!(t.net.book().get(host).is_some(), "{host} kept");
        }
    }

    #[test]
    fn trim_waits_for_enough_connected_peers() {
        let config = NetworkConfig {
            min_known_peers: 1,
            max_known_peers: 2,
            ..test_config()
        };
        let t = test_network(config, 10, StaticResolver::new());
        for i in 1..=4 {
            t.net.book().select_or_create(&format!("198.51.100.{i}"), true);
        }
        trim_pool(&t.net, t.clock.now());
        assert_eq!(t.net.book().size(), 4);
    }

    #[tokio::test]
    async fn idle_inbound_markers_expire() {
        let config = NetworkConfig {
            inbound_idle_timeout_secs: 60,
            max_connected_public_peers: 0,
            ..test_config()
        };
        let t = test_network(config, 10, StaticResolver::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        t.net.events().subscribe(PeerEvent::RemoveInbound, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let fresh = t.net.book().select_or_create("198.51.100.1", true).unwrap();
        let idle = t.net.book().select_or_create("198.51.100.2", true).unwrap();
        fresh.set_last_inbound_request(t.clock.now() - 10);
        idle.set_last_inbound_request(t.clock.now() - 61);

        connect_peers(&t.net).await;
        assert!(fresh.is_inbound());
        assert!(!idle.is_inbound());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn well_known_peers_are_restored_and_retried() {
        let config = NetworkConfig {
            well_known_peers: vec!["198.51.100.77".into()],
            max_connected_public_peers: 0,
            ..test_config()
        };
        let t = test_network(config, 10, StaticResolver::new());
        assert!(t.net.book().get("198.51.100.77").is_none());
        let due = stale_well_known(&t.net, t.clock.now());
        assert_eq!(due.len(), 1);
        assert!(t.net.book().get("198.51.100.77").is_some());

        due[0].mark_connect_attempt();
        assert!(stale_well_known(&t.net, t.clock.now()).is_empty());
    }

    #[tokio::test]
    async fn discovery_merges_peers_and_shares_ours() {
        fn gossiping(request: &Value) -> Value {
            if request["requestType"] == "getPeers" {
                json!({
                    "peers": ["198.51.100.20", "198.51.100.21:9000"],
                    "services": ["0", "4"],
                })
            } else {
                json!({})
            }
        }
        let (port, seen) = fake_peer("127.0.0.1", gossiping).await;
        let t = test_network(
            NetworkConfig {
                enable_hallmark_protection: false,
                ..local_config()
            },
            10,
            StaticResolver::new(),
        );
        let remote = t
            .net
            .book()
            .select_or_create(&format!("127.0.0.1:{port}"), true)
            .unwrap();
        remote.set_state(PeerState::Connected);
        let ours = t.net.book().select_or_create("198.51.100.30", true).unwrap();
        ours.set_share_address(true);
        ours.set_state(PeerState::Connected);
        let idle = t.net.book().select_or_create("198.51.100.31", true).unwrap();
        idle.set_share_address(true);

        exchange_peers(&t.net, &remote).await;

        assert_eq!(request_types(&seen), vec!["getPeers", "addPeers"]);
        assert!(t.net.book().get("198.51.100.20").is_some());
        let with_services = t.net.book().get("198.51.100.21").unwrap();
        assert_eq!(with_services.port(), 9000);
        assert_eq!(with_services.services(), Services(4));

        let shared = seen.lock()[1].clone();
        assert_eq!(shared["peers"], json!(["198.51.100.30"]));
        assert_eq!(shared["services"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_weight_peer_is_dropped_when_outbound_is_saturated() {
        let (port, seen) = fake_peer("127.0.0.1", handshake_reply).await;
        let t = test_network(
            NetworkConfig {
                enable_hallmark_protection: true,
                max_outbound_connections: 1,
                max_connected_public_peers: 5,
                ..local_config()
            },
            10,
            StaticResolver::new(),
        );
        let busy = t.net.book().select_or_create("198.51.100.40", true).unwrap();
        busy.set_state(PeerState::Connected);
        busy.set_last_updated(t.clock.now());
        let fresh = t
            .net
            .book()
            .select_or_create(&format!("127.0.0.1:{port}"), true)
            .unwrap();

        connect_peers(&t.net).await;

        assert_eq!(request_types(&seen), vec!["getInfo"]);
        assert_eq!(t.net.reputation().weight(&fresh), 0);
        assert_eq!(fresh.state(), PeerState::NonConnected);
        assert!(!fresh.is_blacklisted());
        assert_eq!(busy.state(), PeerState::Connected);
    }

    #[tokio::test]
    async fn scheduler_runs_and_stops_tasks() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        scheduler.spawn_periodic("counter", Duration::from_millis(100), move || {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(scheduler.task_names(), vec!["counter"]);
        tokio::time::sleep(Duration::from_millis(350)).await;
        scheduler.shutdown();
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {seen} times");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
        assert!(scheduler.task_names().is_empty());
    }
}
