//! Ledger cursor — tracks the reconciler's position in the chain.

use serde::{Deserialize, Serialize};

/// The reconciler's durable position for one chain.
///
/// The cursor knows:
/// - Which block is the local tip (`watermark_*`)
/// - Which block is the highest confirmed one (`last_confirmed_*`)
/// - Whether confirmations are halted pending operator recovery
///
/// Every write states the `version` it read; the store rejects stale writers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub chain: String,
    /// Highest block whose events are confirmed.
    pub last_confirmed_height: u64,
    /// Hash of that block (empty until the first confirmation).
    pub last_confirmed_hash: String,
    /// Height of the local canonical tip.
    pub watermark_height: u64,
    /// Hash of the local canonical tip (empty until anchored).
    pub watermark_hash: String,
    /// Highest height the chain source has reported.
    pub observed_tip_height: u64,
    /// Recovery-required reason; confirmations stop while set.
    pub halted: Option<String>,
    pub version: u64,
}

impl Cursor {
    /// An unanchored cursor for `chain`.
    pub fn new(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            last_confirmed_height: 0,
            last_confirmed_hash: String::new(),
            watermark_height: 0,
            watermark_hash: String::new(),
            observed_tip_height: 0,
            halted: None,
            version: 0,
        }
    }

    /// Returns `true` once the cursor has a local tip.
    pub fn is_anchored(&self) -> bool {
        !self.watermark_hash.is_empty()
    }

    /// Returns `true` once at least one block has been confirmed.
    pub fn has_confirmed(&self) -> bool {
        !self.last_confirmed_hash.is_empty()
    }

    /// Move the local tip.
    pub fn advance_tip(&mut self, height: u64, hash: impl Into<String>) {
        self.watermark_height = height;
        self.watermark_hash = hash.into();
        self.observed_tip_height = self.observed_tip_height.max(height);
    }

    /// Move the confirmed position.
    pub fn confirm(&mut self, height: u64, hash: impl Into<String>) {
        self.last_confirmed_height = height;
        self.last_confirmed_hash = hash.into();
    }

    pub fn halt(&mut self, reason: impl Into<String>) {
        self.halted = Some(reason.into());
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Returns the next block to fetch (tip + 1), or `None` when unanchored.
    pub fn next_height(&self) -> Option<u64> {
        self.is_anchored().then(|| self.watermark_height + 1)
    }

    /// How far the local tip trails the highest height the source reported.
    pub fn lag_behind_tip(&self) -> u64 {
        self.observed_tip_height.saturating_sub(self.watermark_height)
    }
}

/// Highest height that is final when the tip is at `tip`.
///
/// A block at height `h` is final once `tip - h >= finality_depth`.
pub fn finality_height(tip: u64, finality_depth: u64) -> Option<u64> {
    tip.checked_sub(finality_depth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_advance() {
        let mut cursor = Cursor::new("solana");
        assert!(!cursor.is_anchored());
        assert_eq!(cursor.next_height(), None);
        cursor.advance_tip(101, "0xbbb");
        assert_eq!(cursor.watermark_height, 101);
        assert_eq!(cursor.watermark_hash, "0xbbb");
        assert_eq!(cursor.next_height(), Some(102));
    }

    #[test]
    fn finality_depth_boundary() {
        // 112 - 100 = 12 ≥ 12
        assert_eq!(finality_height(112, 12), Some(100));
        // 111 - 100 = 11 < 12
        assert_eq!(finality_height(111, 12), Some(99));
        assert_eq!(finality_height(5, 12), None);
    }

    #[test]
    fn lag_uses_observed_tip() {
        let mut cursor = Cursor::new("solana");
        cursor.observed_tip_height = 150;
        cursor.advance_tip(140, "0x140");
        assert_eq!(cursor.lag_behind_tip(), 10);
        cursor.halt("reorg too deep");
        assert!(cursor.is_halted());
    }
}
