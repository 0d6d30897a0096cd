use serde_json::{json, Value};
use std::sync::Arc;

use super::id_list;
use crate::p2p::error::PeerError;
use crate::p2p::network::Network;
use crate::p2p::peer::Peer;
use crate::p2p::router::{error_response, TOO_MANY_TRANSACTIONS_REQUESTED, UNSUPPORTED_REQUEST_TYPE};

pub const MAX_TRANSACTIONS_PER_RESPONSE: usize = 100;
pub const MAX_TRANSACTIONS_REQUESTED: usize = 100;

pub(super) fn process_transactions(
    net: &Arc<Network>,
    request: &Value,
    _peer: &Arc<Peer>,
) -> Result<Value, PeerError> {
    net.pool().submit_peer_transactions(request)?;
    Ok(json!({}))
}

pub(super) fn get_unconfirmed_transactions(
    net: &Arc<Network>,
    request: &Value,
    _peer: &Arc<Peer>,
) -> Result<Value, PeerError> {
    let Some(exclude) = request.get("exclude").and_then(Value::as_array) else {
        return Ok(json!({}));
    };
    let exclude = id_list(exclude, "exclude")?;
    let transactions: Vec<Value> = net
        .pool()
        .unconfirmed_excluding(&exclude)
        .iter()
        .take(MAX_TRANSACTIONS_PER_RESPONSE)
        .map(|tx| Value::Object(tx.to_json()))
        .collect();
    Ok(json!({ "unconfirmedTransactions": transactions }))
}

pub(super) fn get_transactions(
    net: &Arc<Network>,
    request: &Value,
    _peer: &Arc<Peer>,
) -> Result<Value, PeerError> {
    if !net.config().include_expired_prunable {
        return Ok(error_response(UNSUPPORTED_REQUEST_TYPE));
    }
    let ids = match request.get("transactionIds").and_then(Value::as_array) {
        Some(ids) if ids.len() <= MAX_TRANSACTIONS_REQUESTED => id_list(ids, "transactionIds")?,
        _ => return Ok(error_response(TOO_MANY_TRANSACTIONS_REQUESTED)),
    };
    let chain = net.chain();
    let transactions: Vec<Value> = ids
        .into_iter()
        .filter_map(|id| chain.transaction(id))
        .map(|tx| Value::Object(tx.to_json()))
        .collect();
    Ok(json!({ "transactions": transactions }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{id_to_string, Transaction, ValidationError};
    use crate::config::NetworkConfig;
    use crate::p2p::address::StaticResolver;
    use crate::p2p::test_utils::{test_config, test_network, TestNetwork};

    fn setup(config: NetworkConfig) -> (TestNetwork, Arc<Peer>) {
        let t = test_network(config, 10, StaticResolver::new());
        let peer = t.net.book().select_or_create("198.51.100.9", true).unwrap();
        (t, peer)
    }

    #[test]
    fn unconfirmed_requires_exclude_and_is_capped() {
        let (t, peer) = setup(test_config());
        for id in 1..=150u64 {
            t.pool.add_unconfirmed(Transaction::new(id));
        }
        assert_eq!(get_unconfirmed_transactions(&t.net, &json!({}), &peer).unwrap(), json!({}));

        let resp = get_unconfirmed_transactions(&t.net, &json!({"exclude": ["1", "2"]}), &peer).unwrap();
        let txs = resp["unconfirmedTransactions"].as_array().unwrap();
        assert_eq!(txs.len(), MAX_TRANSACTIONS_PER_RESPONSE);
        assert_eq!(txs[0]["transaction"], id_to_string(3));
    }

    #[test]
    fn process_transactions_forwards_to_pool() {
        let (t, peer) = setup(test_config());
        let req = json!({"transactions": [{"transaction": "5"}]});
        process_transactions(&t.net, &req, &peer).unwrap();
        assert_eq!(t.pool.submitted_transactions(), vec![req.clone()]);

        t.pool.reject_with(Some(ValidationError::Invalid("double spend".into())));
        assert!(matches!(
            process_transactions(&t.net, &req, &peer),
            Err(PeerError::Validation(_))
        ));
    }

    #[test]
    fn get_transactions_needs_prunable_archive() {
        let (t, peer) = setup(test_config());
        let resp = get_transactions(&t.net, &json!({"transactionIds": ["1"]}), &peer).unwrap();
        assert_eq!(resp["error"], UNSUPPORTED_REQUEST_TYPE);
    }

    #[test]
    fn get_transactions_returns_known_ids() {
        let (t, peer) = setup(NetworkConfig {
            include_expired_prunable: true,
            ..test_config()
        });
        t.chain.insert_transaction(Transaction::new(8));
        let resp = get_transactions(&t.net, &json!({"transactionIds": ["8", "9"]}), &peer).unwrap();
        assert_eq!(resp["transactions"].as_array().unwrap().len(), 1);

        let too_many: Vec<String> = (0..101).map(|i| i.to_string()).collect();
        let resp = get_transactions(&t.net, &json!({"transactionIds": too_many}), &peer).unwrap();
        assert_eq!(resp["error"], TOO_MANY_TRANSACTIONS_REQUESTED);
        let resp = get_transactions(&t.net, &json!({}), &peer).unwrap();
        assert_eq!(resp["error"], TOO_MANY_TRANSACTIONS_REQUESTED);
    }
}
