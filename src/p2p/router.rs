//! Inbound request dispatch.
//!
//! Every request, whichever transport it arrived on, goes through
//! [`RequestRouter::process`]: peer admission checks first, then the handler
//! registered for its `requestType`.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use super::error::PeerError;
use super::handlers;
use super::network::Network;
use super::peer::{Peer, PeerEvent, PeerState};

pub const PROTOCOL: u64 = 1;

pub const BLACKLISTED: &str = "Your peer is blacklisted";
pub const UNKNOWN_PEER: &str = "Your peer address cannot be resolved";
pub const UNSUPPORTED_REQUEST_TYPE: &str = "Unsupported request type!";
pub const UNSUPPORTED_PROTOCOL: &str = "Unsupported protocol!";
pub const SEQUENCE_ERROR: &str = "Peer request received before 'getInfo' request";
pub const MAX_INBOUND_CONNECTIONS: &str = "Maximum number of inbound connections exceeded";
pub const INVALID_ANNOUNCED_ADDRESS: &str = "Invalid announced address";
pub const DOWNLOADING: &str = "Blockchain download in progress";
pub const LIGHT_CLIENT: &str = "Peer is in light mode";
pub const TOO_MANY_BLOCKS_REQUESTED: &str = "Too many blocks requested";
pub const TOO_MANY_TRANSACTIONS_REQUESTED: &str = "Too many transactions requested";

pub const GET_INFO: &str = "getInfo";

pub type HandlerFn = fn(&Arc<Network>, &Value, &Arc<Peer>) -> Result<Value, PeerError>;

#[derive(Clone, Copy)]
pub struct Handler {
    /// Answered only by a node that is caught up and keeps full chain data
    pub reject_while_downloading: bool,
    pub handle: HandlerFn,
}

pub fn error_response(message: &str) -> Value {
    json!({ "error": message })
}

pub struct RequestRouter {
    handlers: HashMap<&'static str, Handler>,
}

impl Default for RequestRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRouter {
    pub fn new() -> Self {
        let mut handlers = HashMap::new();
        handlers::register(&mut handlers);
        Self { handlers }
    }

    pub fn handles(&self, request_type: &str) -> bool {
        self.handlers.contains_key(request_type)
    }

    /// Handle one request from `host`. Returns the response and, once
    /// admitted, the peer it came from.
    pub fn process(
        &self,
        net: &Arc<Network>,
        host: &str,
        body: &[u8],
    ) -> (Value, Option<Arc<Peer>>) {
        let book = net.book();
        if let Some(known) = book.get(host) {
            if known.is_blacklisted() {
                return (blacklisted_response(&known), None);
            }
        }
        let peer = host
            .parse::<IpAddr>()
            .ok()
            .and_then(|ip| book.find_or_create_ip(ip, None, true))
            .map(|(peer, _)| peer);
        let Some(peer) = peer else {
            return (error_response(UNKNOWN_PEER), None);
        };
        if peer.is_blacklisted() {
            return (blacklisted_response(&peer), None);
        }

        let request: Value = match serde_json::from_slice(body) {
            Ok(v @ Value::Object(_)) => v,
            Ok(_) => {
                let err = PeerError::protocol("request is not a JSON object");
                return (self.failed(net, &peer, err), Some(peer));
            }
            Err(e) => return (self.failed(net, &peer, e.into()), Some(peer)),
        };
        let response = self.dispatch(net, &request, &peer);
        (response, Some(peer))
    }

    fn dispatch(&self, net: &Arc<Network>, request: &Value, peer: &Arc<Peer>) -> Value {
        if request.get("protocol").and_then(Value::as_u64) != Some(PROTOCOL) {
            debug!(peer = %peer.host(), "[ROUTER] Unsupported protocol");
            return error_response(UNSUPPORTED_PROTOCOL);
        }
        let request_type = request
            .get("requestType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let Some(handler) = self.handlers.get(request_type).copied() else {
            debug!(peer = %peer.host(), request_type, "[ROUTER] Unsupported request type");
            return error_response(UNSUPPORTED_REQUEST_TYPE);
        };

        let handshaken = peer.version().is_some();
        if peer.state() == PeerState::Disconnected && handshaken {
            peer.set_state(PeerState::Connected);
        }
        if !handshaken && request_type != GET_INFO {
            return error_response(SEQUENCE_ERROR);
        }

        if handler.reject_while_downloading {
            if net.chain().is_downloading() {
                return error_response(DOWNLOADING);
            }
            if net.config().light_client {
                return error_response(LIGHT_CLIENT);
            }
        }

        if !peer.is_inbound() {
            let max = net.config().max_inbound_connections;
            if book_inbound_count(net, max) >= max {
                return error_response(MAX_INBOUND_CONNECTIONS);
            }
            peer.set_last_inbound_request(net.now());
            peer.notify(PeerEvent::AddInbound);
        } else {
            peer.set_last_inbound_request(net.now());
        }

        match (handler.handle)(net, request, peer) {
            Ok(response) => response,
            Err(err) => self.failed(net, peer, err),
        }
    }

    fn failed(&self, net: &Arc<Network>, peer: &Arc<Peer>, err: PeerError) -> Value {
        net.reputation().blacklist_for(peer, &err);
        let message = if net.config().hide_error_details {
            err.kind().to_string()
        } else {
            err.to_string()
        };
        json!({ "error": message })
    }
}

fn book_inbound_count(net: &Network, limit: usize) -> usize {
    net.book().count_up_to(limit, |p| p.is_inbound())
}

fn blacklisted_response(peer: &Peer) -> Value {
    json!({
        "error": BLACKLISTED,
        "cause": peer.blacklisting_cause().unwrap_or_else(|| "unknown".to_string()),
    })
}
