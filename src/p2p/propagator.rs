//! Push-style gossip of new blocks and transactions.

use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::network::Network;
use super::peer::{Peer, PeerState};
use crate::chain::{Block, Transaction};

impl Network {
    /// Announce a block to a bounded set of peers.
    pub fn broadcast_block(self: &Arc<Self>, block: &Block) -> JoinHandle<usize> {
        let mut request = block.to_json();
        request.insert("requestType".into(), json!("processBlock"));
        self.send_to_some_peers(request)
    }

    /// Announce transactions in batches; one fan-out per batch.
    pub fn broadcast_transactions(self: &Arc<Self>, transactions: &[Transaction]) -> Vec<JoinHandle<usize>> {
        transaction_batches(transactions, self.config().send_transactions_batch_size)
            .into_iter()
            .map(|request| self.send_to_some_peers(request))
            .collect()
    }

    fn send_to_some_peers(self: &Arc<Self>, request: Map<String, Value>) -> JoinHandle<usize> {
        let net = self.clone();
        tokio::spawn(async move { net.fan_out(request).await })
    }

    fn accepts_push(&self, peer: &Peer) -> bool {
        !peer.is_blacklisted()
            && peer.state() == PeerState::Connected
            && peer.announced_address().is_some()
            && !peer.is_light_client()
            && (!self.config().enable_hallmark_protection
                || self.reputation().weight(peer) >= self.config().push_threshold)
    }

    /// Send `request` to eligible peers in windows until enough of them
    /// acknowledged it. Returns the number of acknowledgements.
    pub async fn fan_out(self: &Arc<Self>, request: Map<String, Value>) -> usize {
        let limit = self.config().send_to_peers_limit.max(1);
        let mut acknowledged = 0;
        let mut window = Vec::new();
        for peer in self.book().filter(|p| self.accepts_push(p)) {
            let net = self.clone();
            let request = request.clone();
            window.push(async move { net.send(&peer, request).await });
            if window.len() >= limit - acknowledged {
                acknowledged += count_acks(join_all(window.drain(..)).await);
                if acknowledged >= limit {
                    break;
                }
            }
        }
        if !window.is_empty() {
            acknowledged += count_acks(join_all(window).await);
        }
        let request_type = request
            .get("requestType")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        debug!(
            request_type,
            acknowledged,
            "[GOSSIP] Fan-out finished"
        );
        acknowledged
    }
}

fn count_acks(responses: Vec<Option<Value>>) -> usize {
    responses
        .iter()
        .filter(|r| matches!(r, Some(v) if v.get("error").is_none()))
        .count()
}

/// Split transactions into `processTransactions` requests of at most
/// `batch_size` each.
pub fn transaction_batches(transactions: &[Transaction], batch_size: usize) -> Vec<Map<String, Value>> {
    transactions
        .chunks(batch_size.max(1))
        .map(|batch| {
            let mut request = Map::new();
            request.insert("requestType".into(), json!("processTransactions"));
            request.insert(
                "transactions".into(),
                Value::Array(batch.iter().map(|tx| Value::Object(tx.to_json())).collect()),
            );
            request
        })
        .collect()
}
