use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

use super::str_field;
use crate::p2p::error::PeerError;
use crate::p2p::network::Network;
use crate::p2p::peer::{BlockchainState, Peer, PeerEvent, PeerState, Services};
use crate::p2p::router::{error_response, INVALID_ANNOUNCED_ADDRESS};
use crate::version::{APPLICATION, VERSION};

/// What this node says about itself, in `getInfo` requests and responses.
pub(crate) fn my_peer_info(net: &Network) -> Map<String, Value> {
    let config = net.config();
    let mut info = Map::new();
    if config.share_my_address {
        if let Some(address) = net.announced_address() {
            info.insert("announcedAddress".into(), Value::String(address));
        }
    }
    info.insert("application".into(), json!(APPLICATION));
    info.insert("version".into(), json!(VERSION));
    info.insert("platform".into(), json!(config.my_platform));
    info.insert("shareAddress".into(), json!(config.share_my_address));
    info.insert("services".into(), json!(net.my_services().to_wire()));
    if let Some(hallmark) = net.my_hallmark() {
        info.insert("hallmark".into(), json!(hallmark));
    }
    let state = if config.light_client {
        BlockchainState::LightClient
    } else if net.chain().is_downloading() {
        BlockchainState::Downloading
    } else {
        BlockchainState::UpToDate
    };
    info.insert("blockchainState".into(), json!(state));
    info
}

pub(super) fn get_info(net: &Arc<Network>, request: &Value, peer: &Arc<Peer>) -> Result<Value, PeerError> {
    peer.set_last_updated(net.now());

    if let Some(announced) = str_field(request, "announcedAddress") {
        if !net.reputation().verify_announced_address(peer, announced) {
            debug!(peer = %peer.host(), announced, "[ROUTER] GetInfo: announced address does not match peer");
            peer.set_state(PeerState::NonConnected);
            return Ok(error_response(INVALID_ANNOUNCED_ADDRESS));
        }
        let normalized = net.normalize_address(announced);
        if normalized.is_some() && normalized != peer.announced_address() {
            let old_port = peer.port();
            net.book().set_announced_address(peer, announced)?;
            if peer.port() != old_port {
                peer.set_state(PeerState::NonConnected);
            }
        }
    }

    peer.set_application(str_field(request, "application").unwrap_or("?"))?;
    peer.set_version(str_field(request, "version").unwrap_or("?"))?;
    peer.set_platform(str_field(request, "platform").unwrap_or("?"))?;
    peer.set_share_address(request.get("shareAddress").and_then(Value::as_bool) == Some(true));
    net.reputation()
        .analyze_hallmark(peer, request.get("hallmark").and_then(Value::as_str));

    if request.get("services").is_some() && peer.set_services(Services::from_wire(request.get("services"))) {
        peer.notify(PeerEvent::ChangedServices);
    }
    peer.set_blockchain_state(
        request
            .get("blockchainState")
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
    );

    Ok(Value::Object(my_peer_info(net)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::p2p::address::StaticResolver;
    use crate::p2p::test_utils::{test_config, test_network};
    use crate::config::NetworkConfig;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (crate::p2p::test_utils::TestNetwork, Arc<Peer>) {
        let ip: IpAddr = "198.51.100.9".parse().unwrap();
        let resolver = StaticResolver::new().with("node.example.org", &[ip]);
        let t = test_network(
            NetworkConfig {
                my_address: Some("203.0.113.1".into()),
                ..test_config()
            },
            10,
            resolver,
        );
        let peer = t.net.book().select_or_create("198.51.100.9", true).unwrap();
        (t, peer)
    }

    #[test]
    fn records_peer_metadata() {
        let (t, peer) = setup();
        let resp = get_info(
            &t.net,
            &json!({
                "announcedAddress": "node.example.org",
                "application": "Forge",
                "version": "1.4.0",
                "platform": "linux",
                "shareAddress": true,
                "services": "6",
                "blockchainState": "UP_TO_DATE",
            }),
            &peer,
        )
        .unwrap();
        assert_eq!(peer.announced_address().as_deref(), Some("node.example.org"));
        assert_eq!(peer.application().as_deref(), Some("Forge"));
        assert_eq!(peer.platform().as_deref(), Some("linux"));
        assert!(peer.share_address());
        assert_eq!(peer.services(), Services(6));
        assert_eq!(peer.blockchain_state(), Some(BlockchainState::UpToDate));
        assert_eq!(peer.last_updated(), t.clock.now());

        assert_eq!(resp["announcedAddress"], "203.0.113.1");
        assert_eq!(resp["application"], APPLICATION);
        assert_eq!(resp["blockchainState"], "UP_TO_DATE");
    }

    #[test]
    fn missing_fields_default_to_question_mark() {
        let (t, peer) = setup();
        get_info(&t.net, &json!({}), &peer).unwrap();
        assert_eq!(peer.application().as_deref(), Some("?"));
        // "?" is not a version at all, so the peer counts as old
        assert!(peer.is_old_version());
    }

    #[test]
    fn invalid_announced_address_is_rejected() {
        let (t, peer) = setup();
        peer.set_state(PeerState::Connected);
        let resp = get_info(&t.net, &json!({"announcedAddress": "203.0.113.77", "version": "1.0.0"}), &peer).unwrap();
        assert_eq!(resp["error"], INVALID_ANNOUNCED_ADDRESS);
        assert_eq!(peer.state(), PeerState::NonConnected);
        assert!(peer.version().is_none());
    }

    #[test]
    fn overlong_fields_are_errors() {
        let (t, peer) = setup();
        let err = get_info(&t.net, &json!({"application": "x".repeat(64)}), &peer).unwrap_err();
        assert!(matches!(err, PeerError::InvalidField { field: "application", .. }));
    }

    #[test]
    fn services_change_is_announced() {
        let (t, peer) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        t.net.book().shared().events.subscribe(PeerEvent::ChangedServices, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let req = json!({"version": "1.0.0", "services": "2"});
        get_info(&t.net, &req, &peer).unwrap();
        get_info(&t.net, &req, &peer).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn port_change_drops_connection() {
        let (t, peer) = setup();
        peer.set_state(PeerState::Connected);
        get_info(&t.net, &json!({"announcedAddress": "198.51.100.9:9000", "version": "1.0.0"}), &peer).unwrap();
        assert_eq!(peer.port(), 9000);
        assert_eq!(peer.state(), PeerState::NonConnected);
    }
}
