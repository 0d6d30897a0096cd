use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::p2p::error::PeerError;
use crate::p2p::network::{run_blocking, Network};
use crate::p2p::peer::{Peer, PeerState, Services};

/// Most addresses returned by one `getPeers`
pub const MAX_PEERS_PER_RESPONSE: usize = 100;

/// Connected, sharing, non-blacklisted peers with a known announced address.
pub(crate) fn shareable(peer: &Peer) -> bool {
    !peer.is_blacklisted()
        && peer.state() == PeerState::Connected
        && peer.announced_address().is_some()
        && peer.share_address()
}

pub(super) fn get_peers(net: &Arc<Network>, _request: &Value, _peer: &Arc<Peer>) -> Result<Value, PeerError> {
    let mut peers = Vec::new();
    let mut services = Vec::new();
    for p in net.book().filter(shareable) {
        if peers.len() >= MAX_PEERS_PER_RESPONSE {
            break;
        }
        if let Some(address) = p.announced_address() {
            peers.push(Value::String(address));
            services.push(Value::String(p.services().to_wire()));
        }
    }
    Ok(json!({ "peers": peers, "services": services }))
}

/// Pair each address in a `peers` list with its `services` entry. Services
/// are ignored unless both lists line up.
pub(crate) fn address_entries(message: &Value) -> Vec<(String, Option<Services>)> {
    let Some(addresses) = message.get("peers").and_then(Value::as_array) else {
        return Vec::new();
    };
    let services = message
        .get("services")
        .and_then(Value::as_array)
        .filter(|s| s.len() == addresses.len());
    addresses
        .iter()
        .enumerate()
        .filter_map(|(i, address)| {
            let services = services.map(|s| Services::from_wire(s.get(i)));
            address.as_str().map(|a| (a.to_string(), services))
        })
        .collect()
}

pub(super) fn add_peers(net: &Arc<Network>, request: &Value, peer: &Arc<Peer>) -> Result<Value, PeerError> {
    if request.get("peers").and_then(Value::as_array).is_none() {
        return Ok(json!({}));
    }
    if !net.config().get_more_peers || net.book().too_many() {
        return Ok(json!({}));
    }
    let entries = address_entries(request);

    debug!(peer = %peer.host(), count = entries.len(), "[ROUTER] Received peer addresses");
    let net = net.clone();
    run_blocking(move || {
        net.merge_addresses(&entries);
    });
    Ok(json!({}))
}
