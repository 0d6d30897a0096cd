//! Test helpers: a controllable clock, a quiet default configuration and a
//! fully wired network over in-memory collaborators.

use axum::body::Bytes;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::TcpListener;

use super::address::{Resolver, StaticResolver};
use super::network::{Collaborators, Network};
use super::peer::{PeerEvents, PeerShared};
use crate::chain::{MemoryChain, MemoryPool};
use crate::clock::ManualClock;
use crate::config::NetworkConfig;
use crate::version::VERSION;

/// Shared peer settings driven by a manual clock starting at `start`.
pub fn shared_with_clock(start: u64) -> (Arc<PeerShared>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start));
    let shared = Arc::new(PeerShared {
        events: PeerEvents::new(),
        clock: clock.clone(),
        known_blacklisted: HashSet::new(),
        default_port: 7874,
        min_version: vec![1, 0, 0],
    });
    (shared, clock)
}

/// Mainnet defaults with persistence and background discovery turned off.
pub fn test_config() -> NetworkConfig {
    NetworkConfig {
        save_peers: false,
        get_more_peers: false,
        min_known_peers: 10,
        max_known_peers: 100,
        connect_timeout_ms: 2_000,
        read_timeout_ms: 2_000,
        ..NetworkConfig::default()
    }
}

pub struct TestNetwork {
    pub net: Arc<Network>,
    pub chain: Arc<MemoryChain>,
    pub pool: Arc<MemoryPool>,
    pub clock: Arc<ManualClock>,
}

/// Network over a chain of `height` blocks, never started.
pub fn test_network(config: NetworkConfig, height: u32, resolver: StaticResolver) -> TestNetwork {
    test_network_with(config, height, Arc::new(resolver))
}

pub fn test_network_with(config: NetworkConfig, height: u32, resolver: Arc<dyn Resolver>) -> TestNetwork {
    let chain = Arc::new(MemoryChain::with_height(height));
    let pool = Arc::new(MemoryPool::new());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let net = Network::new(
        config,
        Collaborators {
            chain: chain.clone(),
            pool: pool.clone(),
            clock: clock.clone(),
            resolver,
            store: None,
        },
    )
    .unwrap();
    TestNetwork {
        net,
        chain,
        pool,
        clock,
    }
}

/// Requests a fake peer has received, in arrival order.
pub type SeenRequests = Arc<Mutex<Vec<Value>>>;

/// A peer that answers one-shot POSTs on `ip` with `reply` and records
/// every request body. Returns its port.
pub async fn fake_peer(ip: &str, reply: fn(&Value) -> Value) -> (u16, SeenRequests) {
    let seen: SeenRequests = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let app = Router::new().route(
        "/forge",
        post(move |body: Bytes| {
            let log = log.clone();
            async move {
                let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                let response = reply(&request);
                log.lock().push(request);
                Json(response)
            }
        }),
    );
    let listener = TcpListener::bind((ip, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move { axum::serve(listener, app).await });
    (port, seen)
}

/// Current-version handshake for `getInfo`, an empty ack for anything else.
pub fn handshake_reply(request: &Value) -> Value {
    if request["requestType"] == "getInfo" {
        json!({
            "application": "Forge",
            "version": VERSION,
            "platform": "test",
            "shareAddress": true,
            "services": "0",
        })
    } else {
        json!({})
    }
}

/// Request types a fake peer has seen.
pub fn request_types(seen: &SeenRequests) -> Vec<String> {
    seen.lock()
        .iter()
        .map(|r| r["requestType"].as_str().unwrap_or_default().to_string())
        .collect()
}
