//! Block fetcher — wraps a [`ChainSource`] with per-call timeouts and
//! contiguous range fetching.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;

use chainreactor_core::error::{with_timeout, ReactorError};
use chainreactor_core::source::ChainSource;
use chainreactor_core::types::RemoteBlock;

/// A [`ChainSource`] whose every call is bounded by `timeout_ms`.
pub struct BlockFetcher<C: ?Sized> {
    source: Arc<C>,
    timeout_ms: u64,
}

impl<C: ChainSource + ?Sized> BlockFetcher<C> {
    pub fn new(source: Arc<C>, timeout_ms: u64) -> Self {
        Self { source, timeout_ms }
    }

    pub fn source(&self) -> &Arc<C> {
        &self.source
    }

    /// Fetch the blocks in `[from, to]`, in height order.
    ///
    /// Heights are requested concurrently. The result stops before the first
    /// height the source has no block for, so it is always contiguous.
    pub async fn range(&self, from: u64, to: u64) -> Result<Vec<RemoteBlock>, ReactorError> {
        if to < from {
            return Ok(vec![]);
        }
        let fetched = try_join_all((from..=to).map(|h| self.block_by_height(h))).await?;
        let blocks: Vec<RemoteBlock> = fetched.into_iter().map_while(|b| b).collect();
        tracing::debug!(from, to, got = blocks.len(), "fetched block range");
        Ok(blocks)
    }
}

#[async_trait]
impl<C: ChainSource + ?Sized> ChainSource for BlockFetcher<C> {
    async fn head_height(&self) -> Result<u64, ReactorError> {
        with_timeout("head_height", self.timeout_ms, self.source.head_height()).await
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<RemoteBlock>, ReactorError> {
        with_timeout("block_by_height", self.timeout_ms, self.source.block_by_height(height)).await
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Option<RemoteBlock>, ReactorError> {
        with_timeout("block_by_hash", self.timeout_ms, self.source.block_by_hash(hash)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::scripted::ScriptedChain;

    struct SlowSource;

    #[async_trait]
    impl ChainSource for SlowSource {
        async fn head_height(&self) -> Result<u64, ReactorError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(1)
        }

        async fn block_by_height(&self, _height: u64) -> Result<Option<RemoteBlock>, ReactorError> {
            Ok(None)
        }

        async fn block_by_hash(&self, _hash: &str) -> Result<Option<RemoteBlock>, ReactorError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn range_is_contiguous_and_ordered() {
        let chain = Arc::new(ScriptedChain::new());
        chain.extend(5);
        let fetcher = BlockFetcher::new(chain, 1_000);

        let blocks = fetcher.range(2, 9).await.unwrap();
        let heights: Vec<u64> = blocks.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![2, 3, 4, 5]);
        assert!(fetcher.range(4, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let fetcher = BlockFetcher::new(Arc::new(SlowSource), 20);
        let err = fetcher.head_height().await.unwrap_err();
        assert!(matches!(err, ReactorError::Timeout { ms: 20, .. }));
        assert!(err.is_transient());
    }
}
