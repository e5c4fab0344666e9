//! In-memory chain with scripted reorgs, for tests and simulation.
//!
//! Blocks are named `"{branch}-{height}"`. The first block is at height 1 and
//! names `"genesis"` as its parent. [`ScriptedChain::fork_at`] abandons the
//! canonical blocks from a height upward and starts a new branch there; the
//! abandoned blocks stay reachable by hash, as they would on a real node.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use chainreactor_core::error::ReactorError;
use chainreactor_core::source::ChainSource;
use chainreactor_core::types::{RemoteBlock, RemoteLog, RemoteTransaction};

struct ScriptedState {
    canonical: BTreeMap<u64, RemoteBlock>,
    known: HashMap<String, RemoteBlock>,
    branch: String,
    forks: u32,
    /// Calls left to fail before the source answers again.
    failures: u32,
}

pub struct ScriptedChain {
    state: Mutex<ScriptedState>,
}

impl Default for ScriptedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptedState {
                canonical: BTreeMap::new(),
                known: HashMap::new(),
                branch: "main".into(),
                forks: 0,
                failures: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a block with the given transactions to the canonical tip.
    pub fn push_block(&self, transactions: Vec<RemoteTransaction>) -> RemoteBlock {
        let mut state = self.state();
        let (height, parent_hash) = match state.canonical.values().next_back() {
            Some(tip) => (tip.height + 1, tip.hash.clone()),
            None => (1, "genesis".to_string()),
        };
        let block = RemoteBlock {
            height,
            hash: format!("{}-{height}", state.branch),
            parent_hash,
            timestamp: 1_700_000_000 + height as i64,
            transactions,
        };
        state.canonical.insert(height, block.clone());
        state.known.insert(block.hash.clone(), block.clone());
        block
    }

    /// Append a block holding one transaction that emits `logs`.
    pub fn push_logs(&self, logs: Vec<RemoteLog>) -> RemoteBlock {
        let height = self.tip().map_or(1, |b| b.height + 1);
        let signature = format!("{}-{height}/tx0", self.branch());
        self.push_block(vec![RemoteTransaction { signature, logs }])
    }

    /// Append a block holding a single event.
    pub fn push_event(&self, kind: &str, payload: Value) -> RemoteBlock {
        self.push_logs(vec![RemoteLog {
            kind: kind.to_string(),
            payload,
        }])
    }

    /// Append `count` empty blocks.
    pub fn extend(&self, count: u64) -> Vec<RemoteBlock> {
        (0..count).map(|_| self.push_block(vec![])).collect()
    }

    /// Drop canonical blocks at `height` and above, and name the blocks
    /// produced from now on after a fresh branch. Returns the branch name.
    pub fn fork_at(&self, height: u64) -> String {
        let mut state = self.state();
        state.canonical.retain(|h, _| *h < height);
        state.forks += 1;
        state.branch = format!("fork{}", state.forks);
        tracing::debug!(height, branch = %state.branch, "scripted chain forked");
        state.branch.clone()
    }

    /// Make the next `calls` source calls fail with a transient error.
    pub fn fail_next(&self, calls: u32) {
        self.state().failures = calls;
    }

    pub fn tip(&self) -> Option<RemoteBlock> {
        self.state().canonical.values().next_back().cloned()
    }

    pub fn block_at(&self, height: u64) -> Option<RemoteBlock> {
        self.state().canonical.get(&height).cloned()
    }

    pub fn branch(&self) -> String {
        self.state().branch.clone()
    }

    fn check_failure(state: &mut ScriptedState) -> Result<(), ReactorError> {
        if state.failures > 0 {
            state.failures -= 1;
            return Err(ReactorError::Source("scripted source unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for ScriptedChain {
    async fn head_height(&self) -> Result<u64, ReactorError> {
        let mut state = self.state();
        Self::check_failure(&mut state)?;
        Ok(state.canonical.keys().next_back().copied().unwrap_or(0))
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<RemoteBlock>, ReactorError> {
        let mut state = self.state();
        Self::check_failure(&mut state)?;
        Ok(state.canonical.get(&height).cloned())
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Option<RemoteBlock>, ReactorError> {
        let mut state = self.state();
        Self::check_failure(&mut state)?;
        Ok(state.known.get(hash).cloned())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn blocks_link_to_parents() {
        let chain = ScriptedChain::new();
        let blocks = chain.extend(3);
        assert_eq!(blocks[0].parent_hash, "genesis");
        assert_eq!(blocks[2].hash, "main-3");
        assert_eq!(blocks[2].parent_hash, "main-2");
        assert_eq!(chain.head_height().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn fork_replaces_canonical_blocks() {
        let chain = ScriptedChain::new();
        chain.extend(10);
        assert_eq!(chain.fork_at(10), "fork1");
        let replacement = chain.push_event("nft_minted", json!({"token_id": "1", "owner": "bob"}));
        assert_eq!(replacement.hash, "fork1-10");
        assert_eq!(replacement.parent_hash, "main-9");
        assert_eq!(replacement.transactions[0].signature, "fork1-10/tx0");

        assert_eq!(chain.block_by_height(10).await.unwrap().unwrap().hash, "fork1-10");
        // The abandoned block is still known by hash.
        assert!(chain.block_by_hash("main-10").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let chain = ScriptedChain::new();
        chain.extend(1);
        chain.fail_next(2);
        assert!(chain.head_height().await.unwrap_err().is_transient());
        assert!(chain.block_by_height(1).await.is_err());
        assert!(chain.block_by_height(1).await.unwrap().is_some());
    }
}
