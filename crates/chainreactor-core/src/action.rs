//! Action tasks and the sink boundary the executor drives.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ReactorError;

/// What a rule does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionSpec {
    /// POST the firing payload to an HTTP endpoint.
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Submit an on-chain transaction.
    ChainTransaction {
        /// Program / contract address.
        target: String,
        method: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    /// Dispatch a user notification.
    Notification {
        channel: String,
        recipient: String,
        template: String,
    },
}

impl ActionSpec {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Webhook { .. } => "webhook",
            Self::ChainTransaction { .. } => "chain_transaction",
            Self::Notification { .. } => "notification",
        }
    }
}

/// Lifecycle of an [`ActionTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Executing,
    Succeeded,
    /// Waiting for `next_retry_at`.
    Failed,
    /// Out of attempts or permanently failed; never retried automatically.
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ReactorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "executing" => Ok(Self::Executing),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(ReactorError::Decode(format!("unknown task status '{other}'"))),
        }
    }
}

/// A queued side effect, created atomically with its trigger firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTask {
    pub task_id: u64,
    pub trigger_firing_id: u64,
    pub rule_id: String,
    /// Sequence id of the chain event that fired the rule.
    pub sequence_id: u64,
    pub action: ActionSpec,
    /// Snapshot of the event taken at firing time; sinks send this.
    pub payload: serde_json::Value,
    /// Stable reference for sinks to deduplicate retried deliveries.
    pub idempotency_key: String,
    /// Failed executions so far.
    pub attempt: u32,
    pub next_retry_at: i64,
    /// While executing: when another worker may reclaim the task.
    pub lease_until: Option<i64>,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    /// Sink reference recorded on success.
    pub receipt: Option<String>,
    pub updated_at: i64,
}

/// Task fields supplied by the trigger engine; ids are assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub action: ActionSpec,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub next_retry_at: i64,
}

/// `last_error` of a task whose claim lapsed before the worker reported back.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Parameters of a [`TaskStore::claim_due`](crate::store::TaskStore::claim_due) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRequest {
    pub now: i64,
    pub limit: usize,
    pub lease_until: i64,
    /// An expired claim on the task's last allowed attempt dead-letters it.
    pub max_attempts: u32,
}

/// Outcome of one claim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimBatch {
    /// Now `executing` under the new lease, in `(next_retry_at, task_id)` order.
    pub tasks: Vec<ActionTask>,
    /// Expired claims that used up the last attempt, now `dead`.
    pub dead_lettered: Vec<ActionTask>,
}

/// A failed execution to record.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub attempt: u32,
    /// [`TaskStatus::Failed`] to retry at `next_retry_at`, or [`TaskStatus::Dead`].
    pub status: TaskStatus,
    pub next_retry_at: i64,
    pub error: String,
    pub at: i64,
}

/// Errors returned by an action sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// Worth retrying (network error, 5xx, rate limit).
    #[error("Transient action failure: {0}")]
    Transient(String),

    /// Retrying cannot help (rejected payload, unknown recipient).
    #[error("Permanent action failure: {0}")]
    Permanent(String),

    #[error("Action timed out after {ms}ms")]
    Timeout { ms: u64 },
}

impl ActionError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Result of a successful action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReceipt {
    /// Sink-side reference (HTTP status, tx signature, message id).
    pub reference: String,
}

/// Executes actions on behalf of the executor.
///
/// Implementations must treat `task.idempotency_key` as the delivery identity:
/// the same key may be delivered more than once.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn execute(&self, task: &ActionTask) -> Result<ActionReceipt, ActionError>;
}
