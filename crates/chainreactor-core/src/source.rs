//! Chain source boundary — where remote blocks come from.

use async_trait::async_trait;

use crate::error::ReactorError;
use crate::types::RemoteBlock;

/// A chain RPC / WebSocket collaborator.
///
/// Treated as untrusted: it may skip heights, repeat blocks, or switch forks
/// between calls.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Height of the source's current tip.
    async fn head_height(&self) -> Result<u64, ReactorError>;

    /// The source's canonical block at `height`, if it has one.
    async fn block_by_height(&self, height: u64) -> Result<Option<RemoteBlock>, ReactorError>;

    /// Any block the source knows by hash, canonical or not.
    async fn block_by_hash(&self, hash: &str) -> Result<Option<RemoteBlock>, ReactorError>;
}
