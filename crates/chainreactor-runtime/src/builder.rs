//! Fluent builder API for assembling a pipeline.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainreactor_runtime::{PipelineBuilder, ScriptedChain};
//! use chainreactor_storage::MemoryStore;
//!
//! # fn example() -> Result<(), chainreactor_core::ReactorError> {
//! let pipeline = PipelineBuilder::new()
//!     .chain("solana")
//!     .finality_depth(32)
//!     .lookback_window(256)
//!     .poll_interval_ms(400)
//!     .build(Arc::new(MemoryStore::new()), Arc::new(ScriptedChain::new()))?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chainreactor_core::action::ActionSink;
use chainreactor_core::config::PipelineConfig;
use chainreactor_core::error::ReactorError;
use chainreactor_core::metrics::ReactorMetrics;
use chainreactor_core::retry::RetryConfig;
use chainreactor_core::source::ChainSource;
use chainreactor_core::store::ReactorStore;
use chainreactor_core::trigger::{RuleSource, StaticRuleSource};

use crate::pipeline::Pipeline;
use crate::sinks::ActionRouter;

/// Fluent builder for [`PipelineConfig`] and [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    rules: Option<Arc<dyn RuleSource>>,
    sink: Option<Arc<dyn ActionSink>>,
    metrics: Option<ReactorMetrics>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration (e.g. loaded from a file).
    pub fn from_config(config: PipelineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Set the chain to index (keys the cursor).
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Anchor at this height on first start instead of the source's head.
    pub fn start_height(mut self, height: u64) -> Self {
        self.config.start_height = Some(height);
        self
    }

    /// Blocks that must be built on top of a block before its events confirm.
    pub fn finality_depth(mut self, depth: u64) -> Self {
        self.config.finality_depth = depth;
        self
    }

    pub fn lookback_window(mut self, blocks: u64) -> Self {
        self.config.lookback_window = blocks;
        self
    }

    /// Blocks fetched per reconciliation pass.
    pub fn fetch_batch_size(mut self, size: u64) -> Self {
        self.config.fetch_batch_size = size;
        self
    }

    /// Events read per projector / trigger batch.
    pub fn consumer_batch_size(mut self, size: usize) -> Self {
        self.config.consumer_batch_size = size;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn reconcile_budget_ms(mut self, ms: u64) -> Self {
        self.config.reconcile_budget_ms = ms;
        self
    }

    pub fn source_timeout_ms(mut self, ms: u64) -> Self {
        self.config.source_timeout_ms = ms;
        self
    }

    pub fn store_timeout_ms(mut self, ms: u64) -> Self {
        self.config.store_timeout_ms = ms;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.executor.retry = retry;
        self
    }

    pub fn action_timeout_ms(mut self, ms: u64) -> Self {
        self.config.executor.action_timeout_ms = ms;
        self
    }

    /// Tasks claimed per executor batch.
    pub fn executor_batch_size(mut self, size: usize) -> Self {
        self.config.executor.batch_size = size;
        self
    }

    pub fn rules(mut self, rules: Arc<dyn RuleSource>) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Sink that executes action tasks. Defaults to an empty
    /// [`ActionRouter`], which dead-letters every task.
    pub fn sink(mut self, sink: Arc<dyn ActionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Return the built configuration without assembling a pipeline.
    pub fn build_config(&self) -> PipelineConfig {
        self.config.clone()
    }

    /// Counters handle for every stage (default: the global meter provider).
    pub fn metrics(mut self, metrics: ReactorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build<S, C>(self, store: Arc<S>, source: Arc<C>) -> Result<Pipeline<S, C>, ReactorError>
    where
        S: ReactorStore + ?Sized + 'static,
        C: ChainSource + ?Sized + 'static,
    {
        let rules = self
            .rules
            .unwrap_or_else(|| Arc::new(StaticRuleSource::default()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(ActionRouter::new()));
        let metrics = self.metrics.unwrap_or_else(ReactorMetrics::global);
        Pipeline::new(self.config, store, source, rules, sink, metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedChain;
    use chainreactor_storage::MemoryStore;

    #[test]
    fn builder_defaults() {
        let cfg = PipelineBuilder::new().build_config();
        assert_eq!(cfg.chain, "solana");
        assert_eq!(cfg.finality_depth, 12);
        assert_eq!(cfg.executor.retry.max_attempts, 5);
    }

    #[test]
    fn builder_custom() {
        let cfg = PipelineBuilder::new()
            .chain("solana-devnet")
            .start_height(250_000_000)
            .finality_depth(32)
            .lookback_window(256)
            .fetch_batch_size(10)
            .action_timeout_ms(5_000)
            .build_config();

        assert_eq!(cfg.chain, "solana-devnet");
        assert_eq!(cfg.start_height, Some(250_000_000));
        assert_eq!(cfg.finality_depth, 32);
        assert_eq!(cfg.lookback_window, 256);
        assert_eq!(cfg.fetch_batch_size, 10);
        assert_eq!(cfg.executor.action_timeout_ms, 5_000);
    }

    #[test]
    fn build_rejects_invalid_config() {
        let result = PipelineBuilder::new()
            .chain("")
            .build(Arc::new(MemoryStore::new()), Arc::new(ScriptedChain::new()));
        assert!(matches!(result, Err(ReactorError::Config(_))));
    }
}
