//! Shared types for the indexing pipeline.

use serde::{Deserialize, Serialize};

use crate::error::ReactorError;

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Remote input ─────────────────────────────────────────────────────────────

/// A block as delivered by the chain source.
///
/// Untrusted: blocks may arrive out of order, duplicated, or from a fork that
/// later loses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBlock {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub transactions: Vec<RemoteTransaction>,
}

/// A transaction receipt carried by a [`RemoteBlock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTransaction {
    /// Transaction signature / hash.
    pub signature: String,
    /// Program logs emitted by the transaction, in emission order.
    #[serde(default)]
    pub logs: Vec<RemoteLog>,
}

/// A single program log (e.g. `nft_transferred`) with its raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteLog {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RemoteBlock {
    /// Returns `true` if this block is the direct child of `parent`.
    pub fn extends(&self, parent: &StoredBlock) -> bool {
        self.height == parent.height + 1 && self.parent_hash == parent.hash
    }

    /// The header as it is kept in the local block index.
    pub fn summary(&self) -> StoredBlock {
        StoredBlock {
            height: self.height,
            hash: self.hash.clone(),
            parent_hash: self.parent_hash.clone(),
            timestamp: self.timestamp,
            orphaned: false,
        }
    }

    /// Normalize the block's logs into event drafts.
    ///
    /// `logical_index` is the log's position within its transaction, so the
    /// same log always yields the same [`EventKey`].
    pub fn drafts(&self, observed_at: i64) -> Vec<EventDraft> {
        let mut out = Vec::new();
        for tx in &self.transactions {
            for (i, log) in tx.logs.iter().enumerate() {
                out.push(EventDraft {
                    block_height: self.height,
                    block_hash: self.hash.clone(),
                    tx_signature: tx.signature.clone(),
                    logical_index: i as u32,
                    kind: log.kind.clone(),
                    payload: log.payload.clone(),
                    observed_at,
                });
            }
        }
        out
    }
}

// ─── Local block index ────────────────────────────────────────────────────────

/// A block header in the local block index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
    /// Tombstone set when a reorg excludes the block.
    pub orphaned: bool,
}

impl StoredBlock {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &StoredBlock) -> bool {
        self.height == parent.height + 1 && self.parent_hash == parent.hash
    }
}

// ─── Chain events ─────────────────────────────────────────────────────────────

/// Idempotency key of a chain event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub block_hash: String,
    pub tx_signature: String,
    pub logical_index: u32,
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.block_hash, self.tx_signature, self.logical_index)
    }
}

/// Confirmation status of a [`ChainEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Provisional,
    Confirmed,
    Orphaned,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisional => "provisional",
            Self::Confirmed => "confirmed",
            Self::Orphaned => "orphaned",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = ReactorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisional" => Ok(Self::Provisional),
            "confirmed" => Ok(Self::Confirmed),
            "orphaned" => Ok(Self::Orphaned),
            other => Err(ReactorError::Decode(format!("unknown event status '{other}'"))),
        }
    }
}

/// A normalized event that has not been assigned a sequence id yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub block_height: u64,
    pub block_hash: String,
    pub tx_signature: String,
    pub logical_index: u32,
    pub kind: String,
    pub payload: serde_json::Value,
    /// Unix milliseconds when the indexer first saw the event.
    pub observed_at: i64,
}

impl EventDraft {
    pub fn key(&self) -> EventKey {
        EventKey {
            block_hash: self.block_hash.clone(),
            tx_signature: self.tx_signature.clone(),
            logical_index: self.logical_index,
        }
    }
}

/// An entry of the canonical log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    /// Position in the canonical log; strictly increasing, never reused.
    pub sequence_id: u64,
    pub block_height: u64,
    pub block_hash: String,
    pub tx_signature: String,
    pub logical_index: u32,
    pub kind: String,
    pub payload: serde_json::Value,
    pub observed_at: i64,
    pub status: EventStatus,
    /// Set when a confirmed event was orphaned by a reorg below finality.
    #[serde(default)]
    pub revoked: bool,
}

impl ChainEvent {
    /// Materialize a draft as a provisional log entry.
    pub fn from_draft(draft: EventDraft, sequence_id: u64) -> Self {
        Self {
            sequence_id,
            block_height: draft.block_height,
            block_hash: draft.block_hash,
            tx_signature: draft.tx_signature,
            logical_index: draft.logical_index,
            kind: draft.kind,
            payload: draft.payload,
            observed_at: draft.observed_at,
            status: EventStatus::Provisional,
            revoked: false,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            block_hash: self.block_hash.clone(),
            tx_signature: self.tx_signature.clone(),
            logical_index: self.logical_index,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == EventStatus::Confirmed
    }

    /// Structural sanity check applied by consumers before evaluating an event.
    pub fn validate(&self) -> Result<(), String> {
        if self.kind.trim().is_empty() {
            return Err("event kind is empty".into());
        }
        if !self
            .kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == ':')
        {
            return Err(format!("event kind '{}' contains invalid characters", self.kind));
        }
        if !(self.payload.is_object() || self.payload.is_null()) {
            return Err("event payload is not an object".into());
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(height: u64, hash: &str, parent: &str) -> StoredBlock {
        StoredBlock {
            height,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: (height * 12) as i64,
            orphaned: false,
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = stored(100, "0xaaa", "0x000");
        let child = RemoteBlock {
            height: 101,
            hash: "0xbbb".into(),
            parent_hash: "0xaaa".into(),
            timestamp: 1212,
            transactions: vec![],
        };
        assert!(child.extends(&parent));
        assert!(!child.summary().extends(&child.summary()));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = stored(100, "0xaaa", "0x000");
        let b = stored(102, "0xccc", "0xaaa");
        assert!(!b.extends(&a));
    }

    #[test]
    fn drafts_index_logs_within_transaction() {
        let block = RemoteBlock {
            height: 7,
            hash: "0x07".into(),
            parent_hash: "0x06".into(),
            timestamp: 0,
            transactions: vec![
                RemoteTransaction {
                    signature: "sigA".into(),
                    logs: vec![
                        RemoteLog { kind: "nft_minted".into(), payload: json!({"token_id": "1"}) },
                        RemoteLog { kind: "listing_created".into(), payload: json!({}) },
                    ],
                },
                RemoteTransaction {
                    signature: "sigB".into(),
                    logs: vec![RemoteLog { kind: "vote_cast".into(), payload: json!({}) }],
                },
            ],
        };
        let drafts = block.drafts(42);
        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[1].logical_index, 1);
        assert_eq!(drafts[2].logical_index, 0);
        assert_eq!(drafts[2].tx_signature, "sigB");
        assert_eq!(drafts[0].key().to_string(), "0x07/sigA/0");
    }

    #[test]
    fn status_parses_from_str() {
        assert_eq!("confirmed".parse::<EventStatus>().unwrap(), EventStatus::Confirmed);
        assert!("final".parse::<EventStatus>().is_err());
    }

    #[test]
    fn validate_rejects_malformed_events() {
        let mut ev = ChainEvent::from_draft(
            EventDraft {
                block_height: 1,
                block_hash: "0x1".into(),
                tx_signature: "sig".into(),
                logical_index: 0,
                kind: "nft_minted".into(),
                payload: json!({"token_id": "1"}),
                observed_at: 0,
            },
            1,
        );
        assert!(ev.validate().is_ok());
        ev.payload = json!([1, 2]);
        assert!(ev.validate().is_err());
        ev.payload = json!({});
        ev.kind = "bad kind!".into();
        assert!(ev.validate().is_err());
    }
}
