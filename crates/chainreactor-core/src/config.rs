//! Pipeline configuration and worker state types.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ReactorError;
use crate::retry::RetryConfig;

/// Configuration for one chain's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Chain to index (e.g. `"solana"`). Keys the cursor.
    pub chain: String,
    /// Height to anchor at on first start. `None` = the source's head.
    pub start_height: Option<u64>,
    /// Blocks that must be built on top of a block before its events confirm.
    pub finality_depth: u64,
    /// How far back the reconciler searches for a common ancestor.
    pub lookback_window: u64,
    /// Blocks fetched per reconciliation pass.
    pub fetch_batch_size: u64,
    /// Events read per projector / trigger batch.
    pub consumer_batch_size: usize,
    /// Sleep between worker iterations (milliseconds).
    pub poll_interval_ms: u64,
    /// Upper bound on one reconciliation pass (milliseconds).
    pub reconcile_budget_ms: u64,
    /// Timeout for a single chain source call (milliseconds).
    pub source_timeout_ms: u64,
    /// Timeout for a single store call made by a worker (milliseconds).
    pub store_timeout_ms: u64,
    pub executor: ExecutorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chain: "solana".into(),
            start_height: None,
            finality_depth: 12,
            lookback_window: 128,
            fetch_batch_size: 50,
            consumer_batch_size: 256,
            poll_interval_ms: 2_000,
            reconcile_budget_ms: 30_000,
            source_timeout_ms: 10_000,
            store_timeout_ms: 5_000,
            executor: ExecutorConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ReactorError> {
        if self.chain.trim().is_empty() {
            return Err(ReactorError::Config("chain must not be empty".into()));
        }
        if self.lookback_window <= self.finality_depth {
            return Err(ReactorError::Config(format!(
                "lookback_window ({}) must exceed finality_depth ({})",
                self.lookback_window, self.finality_depth
            )));
        }
        if self.fetch_batch_size == 0 || self.consumer_batch_size == 0 || self.executor.batch_size == 0 {
            return Err(ReactorError::Config("batch sizes must be positive".into()));
        }
        if self.executor.retry.max_attempts == 0 {
            return Err(ReactorError::Config("max_attempts must be at least 1".into()));
        }
        if self.executor.action_timeout_ms == 0 {
            return Err(ReactorError::Config("action_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ReactorError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ReactorError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ReactorError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }
}

/// Action executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub retry: RetryConfig,
    /// Deadline for one action execution (milliseconds).
    pub action_timeout_ms: u64,
    /// Extra lease time beyond the action timeout before a claimed task may
    /// be reclaimed by another worker (milliseconds).
    pub lease_grace_ms: u64,
    /// Tasks claimed per executor iteration.
    pub batch_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            action_timeout_ms: 15_000,
            lease_grace_ms: 15_000,
            batch_size: 32,
        }
    }
}

/// Runtime state of a pipeline worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Not yet started.
    Idle,
    /// Processing batches.
    Running,
    /// Refusing to advance until an operator intervenes.
    Halted,
    /// Shutting down gracefully.
    Stopping,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Halted => write!(f, "halted"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
