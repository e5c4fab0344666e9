//! Block tracker — a sliding window of recent canonical block headers
//! for parent-hash verification and fork resolution.

use std::collections::VecDeque;

use crate::types::StoredBlock;

/// Tracks the last N canonical block headers.
///
/// The reconciler loads the window from the durable block index at the start
/// of every pass, so the tracker never holds state that outlives a pass.
pub struct BlockTracker {
    /// Sliding window of recent blocks (oldest first).
    window: VecDeque<StoredBlock>,
    /// Maximum number of blocks to retain.
    window_size: usize,
}

impl BlockTracker {
    /// Create a new tracker with the given window size.
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    /// Build a tracker from blocks already sorted by height (oldest first).
    pub fn from_blocks(blocks: Vec<StoredBlock>, window_size: usize) -> Self {
        let mut tracker = Self::new(window_size);
        for block in blocks {
            tracker.push_unchecked(block);
        }
        tracker
    }

    /// Add a new block to the tracker.
    ///
    /// Returns `Ok(())` if the block extends the current head.
    /// Returns `Err(reorg_depth)` if the parent hash does not match.
    pub fn push(&mut self, block: StoredBlock) -> Result<(), u64> {
        if let Some(head) = self.window.back() {
            if !block.extends(head) {
                return Err(self.find_reorg_depth(&block));
            }
        }
        self.push_unchecked(block);
        Ok(())
    }

    fn push_unchecked(&mut self, block: StoredBlock) {
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(block);
    }

    /// Returns the current chain head (most recently added block).
    pub fn head(&self) -> Option<&StoredBlock> {
        self.window.back()
    }

    /// Returns the oldest block still in the window.
    pub fn floor(&self) -> Option<&StoredBlock> {
        self.window.front()
    }

    /// Returns a block by height if it's in the window.
    pub fn get(&self, height: u64) -> Option<&StoredBlock> {
        self.window.iter().rev().find(|b| b.height == height)
    }

    /// Returns the highest block at or below `height`.
    pub fn at_or_below(&self, height: u64) -> Option<&StoredBlock> {
        self.window.iter().rev().find(|b| b.height <= height)
    }

    /// Returns a block by hash if it's in the window.
    pub fn find_hash(&self, hash: &str) -> Option<&StoredBlock> {
        self.window.iter().rev().find(|b| b.hash == hash)
    }

    pub fn contains_hash(&self, hash: &str) -> bool {
        self.find_hash(hash).is_some()
    }

    /// Number of blocks in the window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Returns `true` if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Rewind the tracker to a given height, returning the discarded blocks
    /// (most recent first).
    pub fn rewind_to(&mut self, height: u64) -> Vec<StoredBlock> {
        let mut dropped = Vec::new();
        while let Some(back) = self.window.back() {
            if back.height > height {
                if let Some(b) = self.window.pop_back() {
                    dropped.push(b);
                }
            } else {
                break;
            }
        }
        dropped
    }

    /// Find how deep the reorg is by scanning the window.
    fn find_reorg_depth(&self, new_block: &StoredBlock) -> u64 {
        // Walk from newest to oldest looking for a common ancestor
        for (i, tracked) in self.window.iter().enumerate().rev() {
            if tracked.hash == new_block.parent_hash {
                return (self.window.len() - 1 - i) as u64;
            }
        }
        // Common ancestor not in window
        self.window.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(height: u64, hash: &str, parent: &str) -> StoredBlock {
        StoredBlock {
            height,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: (height * 12) as i64,
            orphaned: false,
        }
    }

    fn chain(from: u64, to: u64) -> Vec<StoredBlock> {
        (from..=to)
            .map(|i| {
                let prev = if i == from { "0x0".to_string() } else { format!("0x{}", i - 1) };
                block(i, &format!("0x{i}"), &prev)
            })
            .collect()
    }

    #[test]
    fn push_normal_chain() {
        let mut tracker = BlockTracker::new(10);
        tracker.push(block(100, "0xa", "0x0")).unwrap();
        tracker.push(block(101, "0xb", "0xa")).unwrap();
        tracker.push(block(102, "0xc", "0xb")).unwrap();
        assert_eq!(tracker.head().unwrap().height, 102);
        assert_eq!(tracker.floor().unwrap().height, 100);
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn push_detects_reorg_depth() {
        let mut tracker = BlockTracker::new(10);
        tracker.push(block(100, "0xa", "0x0")).unwrap();
        tracker.push(block(101, "0xb", "0xa")).unwrap();
        // Sibling of 0xb: shares parent 0xa, so one block must be dropped
        let result = tracker.push(block(102, "0xc2", "0xa"));
        assert_eq!(result, Err(1));
        let result = tracker.push(block(102, "0xc3", "0xunknown"));
        assert_eq!(result, Err(2));
    }

    #[test]
    fn rewind_returns_dropped_blocks() {
        let mut tracker = BlockTracker::from_blocks(chain(100, 110), 32);
        assert_eq!(tracker.head().unwrap().height, 110);
        let dropped = tracker.rewind_to(105);
        assert_eq!(tracker.head().unwrap().height, 105);
        assert_eq!(dropped.len(), 5);
        assert_eq!(dropped[0].height, 110);
    }

    #[test]
    fn window_size_enforced() {
        let tracker = BlockTracker::from_blocks(chain(0, 9), 5);
        assert_eq!(tracker.len(), 5); // oldest blocks evicted
        assert_eq!(tracker.floor().unwrap().height, 5);
    }

    #[test]
    fn lookup_by_hash_and_height() {
        let tracker = BlockTracker::from_blocks(chain(100, 104), 16);
        assert!(tracker.contains_hash("0x102"));
        assert!(!tracker.contains_hash("0x999"));
        assert_eq!(tracker.get(103).unwrap().hash, "0x103");
        assert_eq!(tracker.at_or_below(200).unwrap().height, 104);
        assert!(tracker.at_or_below(50).is_none());
    }
}
