//! Chain collaborators consumed by the peer layer.
//!
//! The blockchain state machine, consensus and the unconfirmed transaction
//! pool live outside this crate. The peer layer only needs the query surface
//! in [`Blockchain`] and the submission surface in [`TransactionPool`]; both
//! are called concurrently from many peer-handling tasks.
//!
//! [`MemoryChain`] and [`MemoryPool`] are simple thread-safe implementations
//! used by the standalone binary and the test-suite.

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

pub type BlockId = u64;
pub type TransactionId = u64;
pub type AccountId = u64;

/// Render an id the way it travels on the wire (unsigned decimal string).
pub fn id_to_string(id: u64) -> String {
    id.to_string()
}

/// Parse a wire id. Accepts decimal strings and plain JSON numbers.
pub fn parse_id(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Failure reported by the chain collaborators when validating peer data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("not currently valid: {0}")]
    NotCurrentlyValid(String),
    #[error("feature not yet enabled: {0}")]
    NotYetEnabled(String),
    #[error("block out of order: {0}")]
    BlockOutOfOrder(String),
    #[error("storage timeout: {0}")]
    StorageTimeout(String),
    #[error("invalid: {0}")]
    Invalid(String),
}

impl ValidationError {
    /// Conditions that say nothing about the honesty of the sender
    pub fn is_benign(&self) -> bool {
        !matches!(self, ValidationError::Invalid(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSummary {
    pub id: BlockId,
    pub previous_id: BlockId,
    pub height: u32,
    pub timestamp: u32,
    pub cumulative_difficulty: u128,
    pub base_target: u64,
}

/// A block as exchanged between peers.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub summary: BlockSummary,
    /// Remaining block fields, passed through untouched
    pub body: Map<String, Value>,
}

impl Block {
    pub fn id(&self) -> BlockId {
        self.summary.id
    }

    /// Wire form: body fields plus `block`, `previousBlock`, `height`, `timestamp`
    pub fn to_json(&self) -> Map<String, Value> {
        let mut json = self.body.clone();
        json.insert("block".into(), Value::String(id_to_string(self.summary.id)));
        json.insert(
            "previousBlock".into(),
            Value::String(id_to_string(self.summary.previous_id)),
        );
        json.insert("height".into(), Value::from(self.summary.height));
        json.insert("timestamp".into(), Value::from(self.summary.timestamp));
        json
    }
}

/// A transaction as exchanged between peers.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub body: Map<String, Value>,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            body: Map::new(),
        }
    }

    pub fn to_json(&self) -> Map<String, Value> {
        let mut json = self.body.clone();
        json.insert("transaction".into(), Value::String(id_to_string(self.id)));
        json
    }
}

/// Read-only view of the local chain.
pub trait Blockchain: Send + Sync {
    fn height(&self) -> u32;
    fn tip(&self) -> BlockSummary;
    fn block_id_at_height(&self, height: u32) -> Option<BlockId>;
    fn block_height(&self, id: BlockId) -> Option<u32>;
    fn has_block(&self, id: BlockId) -> bool {
        self.block_height(id).is_some()
    }
    fn block_ids_after(&self, id: BlockId, limit: usize) -> Vec<BlockId>;
    fn blocks_after(&self, id: BlockId, limit: usize) -> Vec<Block>;
    /// Blocks after `id` for as long as they match `ids` in order
    fn blocks_after_ids(&self, id: BlockId, ids: &[BlockId]) -> Vec<Block>;
    /// Balance in base units; zero for unknown accounts
    fn account_balance(&self, account: AccountId) -> i64;
    /// True while the node is catching up with the network
    fn is_downloading(&self) -> bool;
    fn transaction(&self, id: TransactionId) -> Option<Transaction>;
}

/// Unconfirmed transaction pool and intake for peer-supplied chain data.
pub trait TransactionPool: Send + Sync {
    /// Unconfirmed transactions not in `exclude`, in pool order
    fn unconfirmed_excluding(&self, exclude: &[TransactionId]) -> Vec<Transaction>;
    fn submit_peer_block(&self, block: &Value) -> Result<(), ValidationError>;
    fn submit_peer_transactions(&self, request: &Value) -> Result<(), ValidationError>;
}

/// In-memory chain: block at index `h` has height `h`.
pub struct MemoryChain {
    blocks: RwLock<Vec<Block>>,
    balances: RwLock<HashMap<AccountId, i64>>,
    transactions: RwLock<HashMap<TransactionId, Transaction>>,
    downloading: AtomicBool,
}

impl MemoryChain {
    /// Genesis-only chain
    pub fn new() -> Self {
        Self::with_height(0)
    }

    /// Synthetic chain with blocks at heights `0..=height`
    pub fn with_height(height: u32) -> Self {
        let blocks = (0..=height).map(Self::synthetic_block).collect();
        Self {
            blocks: RwLock::new(blocks),
            balances: RwLock::new(HashMap::new()),
            transactions: RwLock::new(HashMap::new()),
            downloading: AtomicBool::new(false),
        }
    }

    pub fn synthetic_id(height: u32) -> BlockId {
        0x5eed_0000_0000 + u64::from(height)
    }

    fn synthetic_block(height: u32) -> Block {
        Block {
            summary: BlockSummary {
                id: Self::synthetic_id(height),
                previous_id: if height == 0 {
                    0
                } else {
                    Self::synthetic_id(height - 1)
                },
                height,
                timestamp: height * 60,
                cumulative_difficulty: u128::from(height) * 1_000,
                base_target: 153_722_867,
            },
            body: Map::new(),
        }
    }

    pub fn push_block(&self, mut block: Block) {
        let mut blocks = self.blocks.write();
        block.summary.height = blocks.len() as u32;
        blocks.push(block);
    }

    pub fn set_balance(&self, account: AccountId, balance: i64) {
        self.balances.write().insert(account, balance);
    }

    pub fn set_downloading(&self, downloading: bool) {
        self.downloading.store(downloading, Ordering::SeqCst);
    }

    pub fn insert_transaction(&self, tx: Transaction) {
        self.transactions.write().insert(tx.id, tx);
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockchain for MemoryChain {
    fn height(&self) -> u32 {
        (self.blocks.read().len() as u32).saturating_sub(1)
    }

    fn tip(&self) -> BlockSummary {
        let blocks = self.blocks.read();
        match blocks.last() {
            Some(b) => b.summary,
            None => Self::synthetic_block(0).summary,
        }
    }

    fn block_id_at_height(&self, height: u32) -> Option<BlockId> {
        self.blocks.read().get(height as usize).map(Block::id)
    }

    fn block_height(&self, id: BlockId) -> Option<u32> {
        self.blocks
            .read()
            .iter()
            .find(|b| b.id() == id)
            .map(|b| b.summary.height)
    }

    fn block_ids_after(&self, id: BlockId, limit: usize) -> Vec<BlockId> {
        self.blocks_after(id, limit).iter().map(Block::id).collect()
    }

    fn blocks_after(&self, id: BlockId, limit: usize) -> Vec<Block> {
        let Some(height) = self.block_height(id) else {
            return Vec::new();
        };
        self.blocks
            .read()
            .iter()
            .skip(height as usize + 1)
            .take(limit)
            .cloned()
            .collect()
    }

    fn blocks_after_ids(&self, id: BlockId, ids: &[BlockId]) -> Vec<Block> {
        self.blocks_after(id, ids.len())
            .into_iter()
            .zip(ids.iter())
            .take_while(|(block, wanted)| block.id() == **wanted)
            .map(|(block, _)| block)
            .collect()
    }

    fn account_balance(&self, account: AccountId) -> i64 {
        self.balances.read().get(&account).copied().unwrap_or(0)
    }

    fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    fn transaction(&self, id: TransactionId) -> Option<Transaction> {
        self.transactions.read().get(&id).cloned()
    }
}

/// In-memory pool that records what peers submitted.
#[derive(Default)]
pub struct MemoryPool {
    unconfirmed: Mutex<Vec<Transaction>>,
    submitted_blocks: Mutex<Vec<Value>>,
    submitted_transactions: Mutex<Vec<Value>>,
    reject_with: Mutex<Option<ValidationError>>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unconfirmed(&self, tx: Transaction) {
        self.unconfirmed.lock().push(tx);
    }

    /// Make every following submission fail with `err` (None to accept again)
    pub fn reject_with(&self, err: Option<ValidationError>) {
        *self.reject_with.lock() = err;
    }

    pub fn submitted_blocks(&self) -> Vec<Value> {
        self.submitted_blocks.lock().clone()
    }

    pub fn submitted_transactions(&self) -> Vec<Value> {
        self.submitted_transactions.lock().clone()
    }
}

impl TransactionPool for MemoryPool {
    fn unconfirmed_excluding(&self, exclude: &[TransactionId]) -> Vec<Transaction> {
        self.unconfirmed
            .lock()
            .iter()
            .filter(|tx| !exclude.contains(&tx.id))
            .cloned()
            .collect()
    }

    fn submit_peer_block(&self, block: &Value) -> Result<(), ValidationError> {
        if let Some(err) = self.reject_with.lock().clone() {
            return Err(err);
        }
        self.submitted_blocks.lock().push(block.clone());
        Ok(())
    }

    fn submit_peer_transactions(&self, request: &Value) -> Result<(), ValidationError> {
        if let Some(err) = self.reject_with.lock().clone() {
            return Err(err);
        }
        self.submitted_transactions.lock().push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn synthetic_chain_links_blocks() {
        let chain = MemoryChain::with_height(10);
        assert_eq!(chain.height(), 10);
        let tip = chain.tip();
        assert_eq!(tip.id, MemoryChain::synthetic_id(10));
        assert_eq!(tip.previous_id, MemoryChain::synthetic_id(9));
        assert_eq!(chain.block_height(MemoryChain::synthetic_id(4)), Some(4));
    }

    #[test]
    fn blocks_after_ids_stops_at_first_mismatch() {
        let chain = MemoryChain::with_height(10);
        let ids = [
            MemoryChain::synthetic_id(3),
            MemoryChain::synthetic_id(4),
            999,
            MemoryChain::synthetic_id(6),
        ];
        let blocks = chain.blocks_after_ids(MemoryChain::synthetic_id(2), &ids);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn parse_id_accepts_strings_and_numbers() {
        assert_eq!(parse_id(&json!("18446744073709551615")), Some(u64::MAX));
        assert_eq!(parse_id(&json!(42)), Some(42));
        assert_eq!(parse_id(&json!("-1")), None);
        assert_eq!(parse_id(&json!(null)), None);
    }

    #[test]
    fn block_json_carries_linkage() {
        let chain = MemoryChain::with_height(2);
        let block = chain.blocks_after(MemoryChain::synthetic_id(1), 1).remove(0);
        let json = block.to_json();
        assert_eq!(json["previousBlock"], json!(MemoryChain::synthetic_id(1).to_string()));
        assert_eq!(json["timestamp"], json!(120));
    }

    #[test]
    fn benign_validation_errors() {
        assert!(ValidationError::NotYetEnabled("x".into()).is_benign());
        assert!(ValidationError::StorageTimeout("x".into()).is_benign());
        assert!(!ValidationError::Invalid("x".into()).is_benign());
    }
}
