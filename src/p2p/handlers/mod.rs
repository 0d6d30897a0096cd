//! Request handlers, one per `requestType`.

mod blocks;
mod info;
mod peers;
mod transactions;

use serde_json::Value;
use std::collections::HashMap;

use super::error::PeerError;
use super::router::{Handler, HandlerFn};
use crate::chain::parse_id;

pub(crate) use info::my_peer_info;
pub(crate) use peers::{address_entries, shareable, MAX_PEERS_PER_RESPONSE};

pub(crate) fn register(table: &mut HashMap<&'static str, Handler>) {
    let mut add = |name: &'static str, reject_while_downloading: bool, handle: HandlerFn| {
        table.insert(
            name,
            Handler {
                reject_while_downloading,
                handle,
            },
        );
    };
    add("getInfo", false, info::get_info);
    add("getPeers", false, peers::get_peers);
    add("addPeers", false, peers::add_peers);
    add("getCumulativeDifficulty", true, blocks::get_cumulative_difficulty);
    add("getMilestoneBlockIds", true, blocks::get_milestone_block_ids);
    add("getNextBlockIds", true, blocks::get_next_block_ids);
    add("getNextBlocks", true, blocks::get_next_blocks);
    add("processBlock", true, blocks::process_block);
    add("processTransactions", true, transactions::process_transactions);
    add("getUnconfirmedTransactions", true, transactions::get_unconfirmed_transactions);
    add("getTransactions", false, transactions::get_transactions);
}

fn str_field<'a>(request: &'a Value, name: &str) -> Option<&'a str> {
    request
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn id_field(request: &Value, name: &'static str) -> Result<u64, PeerError> {
    request
        .get(name)
        .and_then(parse_id)
        .ok_or_else(|| PeerError::invalid(name, "missing or not an unsigned id"))
}

fn id_list(values: &[Value], name: &'static str) -> Result<Vec<u64>, PeerError> {
    values
        .iter()
        .map(|v| parse_id(v).ok_or_else(|| PeerError::invalid(name, v.to_string())))
        .collect()
}

/// Optional numeric `limit`, accepted as a number or a decimal string.
fn limit_field(request: &Value) -> Result<Option<u64>, PeerError> {
    match request.get("limit") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_id(v)
            .map(Some)
            .ok_or_else(|| PeerError::invalid("limit", v.to_string())),
    }
}
