//! Loopback tests: real nodes talking over the peer transport.

use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Map};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use forge_node::chain::{Block, BlockSummary, MemoryChain, MemoryPool};
use forge_node::clock::SystemClock;
use forge_node::config::NetworkConfig;
use forge_node::p2p::{Collaborators, Network, PeerEvent, PeerState, SystemResolver};
use forge_node::version::VERSION;

struct Node {
    net: Arc<Network>,
    pool: Arc<MemoryPool>,
    port: u16,
}

fn node_config(port: u16, persistent: bool) -> NetworkConfig {
    NetworkConfig {
        my_address: Some(format!("127.0.0.1:{port}")),
        local_test_mode: true,
        use_persistent_channels: persistent,
        save_peers: false,
        get_more_peers: false,
        connect_interval_secs: 3600,
        unblacklist_interval_secs: 3600,
        discovery_interval_secs: 3600,
        connect_timeout_ms: 2_000,
        read_timeout_ms: 5_000,
        ..NetworkConfig::default()
    }
}

async fn spawn_node(height: u32, persistent: bool) -> Node {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let pool = Arc::new(MemoryPool::new());
    let net = Network::new(
        node_config(port, persistent),
        Collaborators {
            chain: Arc::new(MemoryChain::with_height(height)),
            pool: pool.clone(),
            clock: Arc::new(SystemClock),
            resolver: Arc::new(SystemResolver),
            store: None,
        },
    )
    .unwrap();
    net.start(listener).await.unwrap();
    Node { net, pool, port }
}

fn request(request_type: &str) -> Map<String, serde_json::Value> {
    let mut map = Map::new();
    map.insert("requestType".into(), json!(request_type));
    map
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nodes_handshake_over_persistent_channel() {
    let a = spawn_node(3, true).await;
    let b = spawn_node(7, true).await;

    let peer = a
        .net
        .book()
        .select_or_create(&format!("127.0.0.1:{}", b.port), true)
        .unwrap();
    a.net.connect(peer.clone()).await;

    assert_eq!(peer.state(), PeerState::Connected);
    assert_eq!(peer.version().as_deref(), Some(VERSION));
    assert!(peer.channel().is_some(), "handshake should open a channel");

    let seen_by_b = b.net.book().get("127.0.0.1").expect("b learned about a");
    assert_eq!(
        seen_by_b.announced_address(),
        Some(format!("127.0.0.1:{}", a.port))
    );
    assert_eq!(seen_by_b.version().as_deref(), Some(VERSION));

    let response = a
        .net
        .send(&peer, request("getCumulativeDifficulty"))
        .await
        .expect("b answers");
    assert_eq!(response["blockchainHeight"], 7);
    assert_eq!(response["cumulativeDifficulty"], "7000");
    assert!(peer.uploaded() > 0 && peer.downloaded() > 0);

    a.net.shutdown().await;
    b.net.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_channel_response_blacklists_peer() {
    let a = spawn_node(3, true).await;
    let b = spawn_node(7, true).await;

    let peer = a
        .net
        .book()
        .select_or_create(&format!("127.0.0.1:{}", b.port), true)
        .unwrap();
    a.net.connect(peer.clone()).await;
    assert_eq!(peer.state(), PeerState::Connected);
    assert!(peer.channel().is_some());

    let response = a
        .net
        .send_with_limit(&peer, request("getCumulativeDifficulty"), 8)
        .await;
    assert!(response.is_none());
    assert!(peer.is_blacklisted());
    assert_eq!(peer.state(), PeerState::NonConnected);

    a.net.shutdown().await;
    b.net.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_shot_mode_handshakes_and_pushes_blocks() {
    let a = spawn_node(3, false).await;
    let b = spawn_node(5, false).await;

    let peer = a
        .net
        .book()
        .select_or_create(&format!("127.0.0.1:{}", b.port), true)
        .unwrap();
    a.net.connect(peer.clone()).await;
    assert_eq!(peer.state(), PeerState::Connected);
    assert!(peer.channel().is_none());

    let block = Block {
        summary: BlockSummary {
            id: 0xfeed,
            previous_id: MemoryChain::synthetic_id(5),
            height: 6,
            timestamp: 360,
            cumulative_difficulty: 6_000,
            base_target: 0,
        },
        body: Map::new(),
    };
    let acknowledged = a.net.broadcast_block(&block).await.unwrap();
    assert_eq!(acknowledged, 1);

    // the receiving node hands the block to its pool off the request path
    let mut submitted = Vec::new();
    for _ in 0..50 {
        submitted = b.pool.submitted_blocks();
        if !submitted.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0]["height"], 6);

    a.net.shutdown().await;
    b.net.shutdown().await;
}

#[tokio::test]
async fn old_version_peer_is_blacklisted_and_never_connected() {
    let fake = Router::new().route(
        "/forge",
        post(|| async {
            Json(json!({
                "application": "Forge",
                "version": "0.5.0",
                "platform": "test",
                "shareAddress": true,
                "services": "0",
            }))
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move { axum::serve(listener, fake).await });

    let net = Network::new(
        node_config(1, false),
        Collaborators {
            chain: Arc::new(MemoryChain::with_height(1)),
            pool: Arc::new(MemoryPool::new()),
            clock: Arc::new(SystemClock),
            resolver: Arc::new(SystemResolver),
            store: None,
        },
    )
    .unwrap();
    let activated = Arc::new(AtomicUsize::new(0));
    let hits = activated.clone();
    net.events().subscribe(PeerEvent::AddedActivePeer, move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    });

    let peer = net
        .book()
        .select_or_create(&format!("127.0.0.1:{port}"), true)
        .unwrap();
    net.connect(peer.clone()).await;

    assert!(peer.is_blacklisted());
    assert_eq!(peer.blacklisting_cause().as_deref(), Some("Old version: 0.5.0"));
    assert_eq!(peer.state(), PeerState::NonConnected);
    assert_eq!(activated.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn metrics_and_version_are_served() {
    let node = spawn_node(2, false).await;
    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", node.port);

    let version: serde_json::Value = client
        .get(format!("{base}/version"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["version"], VERSION);

    let metrics = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("forge_peers_known"));

    // a request with no getInfo first is answered with an error, not dropped
    let reply: serde_json::Value = client
        .post(format!("{base}/forge"))
        .json(&json!({"protocol": 1, "requestType": "getPeers"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(reply.get("error").is_some());

    node.net.shutdown().await;
}
