use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::{id_field, id_list, limit_field, str_field};
use crate::chain::{id_to_string, parse_id};
use crate::p2p::error::PeerError;
use crate::p2p::network::{run_blocking, Network};
use crate::p2p::peer::Peer;
use crate::p2p::router::{error_response, TOO_MANY_BLOCKS_REQUESTED};

pub const MAX_NEXT_BLOCK_IDS: u64 = 1440;
pub const MAX_NEXT_BLOCKS: u64 = 36;
pub const MAX_MILESTONES: usize = 10;
const MAX_MILESTONE_JUMP: u32 = 1440;
const LAST_BLOCK_JUMP: u32 = 10;

pub(super) fn get_cumulative_difficulty(
    net: &Arc<Network>,
    _request: &Value,
    _peer: &Arc<Peer>,
) -> Result<Value, PeerError> {
    let tip = net.chain().tip();
    Ok(json!({
        "cumulativeDifficulty": tip.cumulative_difficulty.to_string(),
        "blockchainHeight": tip.height,
    }))
}

pub(super) fn get_milestone_block_ids(
    net: &Arc<Network>,
    request: &Value,
    peer: &Arc<Peer>,
) -> Result<Value, PeerError> {
    let chain = net.chain();
    let last_block = str_field(request, "lastBlockId");
    if let Some(last) = last_block {
        let id = parse_id(&Value::String(last.to_string()))
            .ok_or_else(|| PeerError::invalid("lastBlockId", last))?;
        let tip_id = chain.tip().id;
        if id == tip_id || chain.has_block(id) {
            let mut response = json!({ "milestoneBlockIds": [id_to_string(id)] });
            if id == tip_id {
                response["last"] = Value::Bool(true);
            }
            return Ok(response);
        }
    }

    let chain_height = chain.height();
    let (mut height, jump) = if let Some(milestone) = str_field(request, "lastMilestoneBlockId") {
        let id = parse_id(&Value::String(milestone.to_string()))
            .ok_or_else(|| PeerError::invalid("lastMilestoneBlockId", milestone))?;
        let milestone_height = chain
            .block_height(id)
            .ok_or_else(|| PeerError::protocol(format!("Don't have block {milestone}")))?;
        let jump = chain_height
            .saturating_sub(milestone_height)
            .clamp(1, MAX_MILESTONE_JUMP);
        (milestone_height.saturating_sub(jump), jump)
    } else if last_block.is_some() {
        (chain_height, LAST_BLOCK_JUMP)
    } else {
        net.reputation().blacklist(peer, "Old getMilestoneBlockIds request");
        return Ok(error_response(
            "Old getMilestoneBlockIds protocol not supported, please upgrade",
        ));
    };

    let mut milestones = Vec::with_capacity(MAX_MILESTONES);
    while height > 0 && milestones.len() < MAX_MILESTONES {
        if let Some(id) = chain.block_id_at_height(height) {
            milestones.push(Value::String(id_to_string(id)));
        }
        height = height.saturating_sub(jump);
    }
    Ok(json!({ "milestoneBlockIds": milestones }))
}

pub(super) fn get_next_block_ids(
    net: &Arc<Network>,
    request: &Value,
    _peer: &Arc<Peer>,
) -> Result<Value, PeerError> {
    let block_id = id_field(request, "blockId")?;
    let limit = limit_field(request)?.unwrap_or(MAX_NEXT_BLOCK_IDS);
    if limit > MAX_NEXT_BLOCK_IDS {
        return Ok(error_response(TOO_MANY_BLOCKS_REQUESTED));
    }
    let ids: Vec<String> = net
        .chain()
        .block_ids_after(block_id, limit as usize)
        .into_iter()
        .map(id_to_string)
        .collect();
    Ok(json!({ "nextBlockIds": ids }))
}

pub(super) fn get_next_blocks(
    net: &Arc<Network>,
    request: &Value,
    _peer: &Arc<Peer>,
) -> Result<Value, PeerError> {
    let block_id = id_field(request, "blockId")?;
    let blocks = match request.get("blockIds").and_then(Value::as_array) {
        Some(wanted) => {
            if wanted.len() as u64 > MAX_NEXT_BLOCKS {
                return Ok(error_response(TOO_MANY_BLOCKS_REQUESTED));
            }
            let ids = id_list(wanted, "blockIds")?;
            net.chain().blocks_after_ids(block_id, &ids)
        }
        None => {
            let limit = limit_field(request)?.unwrap_or(MAX_NEXT_BLOCKS);
            if limit > MAX_NEXT_BLOCKS {
                return Ok(error_response(TOO_MANY_BLOCKS_REQUESTED));
            }
            net.chain().blocks_after(block_id, limit as usize)
        }
    };
    let blocks: Vec<Value> = blocks.iter().map(|b| Value::Object(b.to_json())).collect();
    Ok(json!({ "nextBlocks": blocks }))
}

/// Take a pushed block only if it extends our tip, or if it competes with
/// the tip for the same height and is older than it.
pub(super) fn process_block(
    net: &Arc<Network>,
    request: &Value,
    peer: &Arc<Peer>,
) -> Result<Value, PeerError> {
    let tip = net.chain().tip();
    let previous = request.get("previousBlock").and_then(parse_id);
    let timestamp = request.get("timestamp").and_then(Value::as_u64);
    let extends_tip = previous == Some(tip.id);
    let older_competitor = previous == Some(tip.previous_id)
        && timestamp.is_some_and(|ts| u64::from(tip.timestamp) > ts);
    if !(extends_tip || older_competitor) {
        debug!(peer = %peer.host(), "[ROUTER] Ignoring block that does not fit our tip");
        return Ok(json!({}));
    }

    let net = net.clone();
    let peer = peer.clone();
    let block = request.clone();
    run_blocking(move || {
        if let Err(e) = net.pool().submit_peer_block(&block) {
            net.reputation().blacklist_for(&peer, &PeerError::from(e));
        }
    });
    Ok(json!({}))
}
