//! Saved peer table.
//!
//! One sled tree keyed by announced address, each value a JSON record of the
//! peer's services and last-updated time.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

const TREE: &str = "peers";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPeer {
    pub address: String,
    pub services: u64,
    pub last_updated: u64,
}

pub struct PeerStore {
    tree: sled::Tree,
}

impl PeerStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        let tree = db.open_tree(TREE)?;
        info!(peers = tree.len(), "[PEER STORE] Opened peer table");
        Ok(Self { tree })
    }

    pub fn load(&self) -> Vec<SavedPeer> {
        self.tree
            .iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|(_, val)| serde_json::from_slice(&val).ok())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.tree.len()
    }

    /// Make the table hold exactly `peers`: upsert every record and delete
    /// rows for addresses not in the set. Returns (upserted, deleted).
    pub fn replace_all(&self, peers: &[SavedPeer]) -> Result<(usize, usize)> {
        let keep: HashSet<&str> = peers.iter().map(|p| p.address.as_str()).collect();
        let mut deleted = 0;
        for key in self.tree.iter().keys() {
            let key = key?;
            if !keep.contains(String::from_utf8_lossy(&key).as_ref()) {
                self.tree.remove(&key)?;
                deleted += 1;
            }
        }
        let mut upserted = 0;
        for peer in peers {
            let val = serde_json::to_vec(peer)?;
            let changed = self
                .tree
                .get(peer.address.as_bytes())?
                .map_or(true, |old| old.as_ref() != val.as_slice());
            if changed {
                self.tree.insert(peer.address.as_bytes(), val)?;
                upserted += 1;
            }
        }
        self.tree.flush()?;
        debug!(upserted, deleted, "[PEER STORE] Saved peers");
        Ok((upserted, deleted))
    }
}
