//! Storage traits — the durable store is the only thing the components share.
//!
//! Every cross-component guarantee is a property of these traits:
//! - [`LedgerStore::commit`] applies one reconciliation pass atomically
//! - [`ProjectionStore::write_records`] is a compare-and-set on `last_applied_sequence_id`
//! - [`TriggerStore::fire`] inserts a firing and its task together, unique on `(rule, event)`
//! - [`TaskStore::claim_due`] moves each task to `executing` for exactly one claimant,
//!   and counts an expired claim as a failed attempt

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::{ActionTask, ClaimBatch, ClaimRequest, NewTask, TaskFailure, TaskStatus};
#[cfg(doc)]
use crate::action::LEASE_EXPIRED;
use crate::alarm::{Alarm, NewAlarm};
use crate::cursor::Cursor;
use crate::error::ReactorError;
use crate::log::CanonicalLog;
use crate::projection::{ProjectionKind, ProjectionRecord, RecordRef, RecordWrite};
use crate::trigger::{FireOutcome, NewFiring, TriggerFiring};
use crate::types::{EventDraft, StoredBlock};

// ─── Ledger ───────────────────────────────────────────────────────────────────

/// The work of one reconciliation pass, committed all-or-nothing.
///
/// Applied in this order: orphan `orphan_blocks`, adopt `adopt_blocks`, append
/// `events`, confirm up to `confirm_up_to`, record `alarms`, then write `cursor`
/// with its version bumped.
#[derive(Debug, Clone)]
pub struct LedgerCommit {
    /// Version the reconciler read; the commit fails if the cursor moved.
    pub expected_version: u64,
    pub cursor: Cursor,
    /// Hashes of previously committed blocks that a reorg excluded.
    pub orphan_blocks: Vec<String>,
    /// New (or re-adopted) canonical blocks, ascending by height.
    pub adopt_blocks: Vec<StoredBlock>,
    pub events: Vec<EventDraft>,
    pub confirm_up_to: Option<u64>,
    pub alarms: Vec<NewAlarm>,
}

impl LedgerCommit {
    /// A commit that only rewrites the cursor.
    pub fn cursor_only(expected_version: u64, cursor: Cursor) -> Self {
        Self {
            expected_version,
            cursor,
            orphan_blocks: Vec::new(),
            adopt_blocks: Vec::new(),
            events: Vec::new(),
            confirm_up_to: None,
            alarms: Vec::new(),
        }
    }
}

/// What a [`LedgerCommit`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub appended: u64,
    pub duplicates: u64,
    pub orphaned: u64,
    pub confirmed: u64,
    /// Sequence ids of confirmed events that were orphaned.
    pub revoked: Vec<u64>,
    pub cursor_version: u64,
}

/// Cursor and block-index storage, on top of the canonical log.
#[async_trait]
pub trait LedgerStore: CanonicalLog {
    async fn load_cursor(&self, chain: &str) -> Result<Option<Cursor>, ReactorError>;

    /// Canonical (non-orphaned) blocks with `height >= from_height`, ascending.
    async fn canonical_blocks_from(&self, from_height: u64) -> Result<Vec<StoredBlock>, ReactorError>;

    /// Any stored block, canonical or orphaned.
    async fn block_by_hash(&self, hash: &str) -> Result<Option<StoredBlock>, ReactorError>;

    /// Apply a reconciliation pass atomically.
    ///
    /// Fails with [`ReactorError::VersionConflict`] if the stored cursor
    /// version differs from `commit.expected_version` (0 = no cursor yet).
    async fn commit(&self, commit: LedgerCommit) -> Result<CommitSummary, ReactorError>;
}

// ─── Projections ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait ProjectionStore: Send + Sync {
    async fn load_record(&self, target: &RecordRef) -> Result<Option<ProjectionRecord>, ReactorError>;

    /// Apply all writes atomically, or none if any expectation is stale.
    /// Returns `false` when the compare-and-set lost.
    async fn write_records(&self, writes: Vec<RecordWrite>) -> Result<bool, ReactorError>;

    /// All records of one kind, ordered by key.
    async fn records(&self, kind: ProjectionKind) -> Result<Vec<ProjectionRecord>, ReactorError>;
}

// ─── Consumers ────────────────────────────────────────────────────────────────

/// Audit record for an event a consumer could not process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEvent {
    pub consumer: String,
    pub sequence_id: u64,
    pub reason: String,
    pub recorded_at: i64,
}

/// Per-consumer watermarks and skipped-event audit.
#[async_trait]
pub trait ConsumerStore: Send + Sync {
    /// Last sequence id the consumer durably processed (0 if none).
    async fn load_offset(&self, consumer: &str) -> Result<u64, ReactorError>;

    /// Advance the watermark; never moves it backwards.
    async fn save_offset(&self, consumer: &str, sequence_id: u64) -> Result<(), ReactorError>;

    /// Record a skipped event; one record per `(consumer, sequence_id)`.
    async fn record_skipped(&self, skipped: SkippedEvent) -> Result<(), ReactorError>;

    async fn skipped_count(&self) -> Result<u64, ReactorError>;
}

// ─── Triggers & tasks ─────────────────────────────────────────────────────────

#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Insert the firing and its task in one commit, unless a firing for
    /// `(rule_id, sequence_id)` exists, in which case nothing is written.
    async fn fire(&self, firing: NewFiring, task: NewTask) -> Result<FireOutcome, ReactorError>;

    async fn firing(&self, rule_id: &str, sequence_id: u64) -> Result<Option<TriggerFiring>, ReactorError>;

    async fn firings(&self) -> Result<Vec<TriggerFiring>, ReactorError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Claim up to `limit` due tasks, all in one commit.
    ///
    /// First every `executing` task whose lease expired counts the lapsed
    /// claim as a failed attempt (`last_error` = [`LEASE_EXPIRED`]): it
    /// becomes `dead` once `attempt >= max_attempts`, otherwise `failed`.
    /// Then `queued`/`failed` tasks with `next_retry_at <= now` move to
    /// `executing` with `lease_until` set.
    async fn claim_due(&self, request: ClaimRequest) -> Result<ClaimBatch, ReactorError>;

    /// Mark a task `succeeded` and its firing `completed`, if it is still
    /// executing under the claim taken at `attempt`. Returns `false` otherwise.
    async fn complete_task(&self, task_id: u64, attempt: u32, receipt: &str, at: i64) -> Result<bool, ReactorError>;

    /// Record a failed execution of the claim taken at `failure.attempt - 1`.
    /// Returns `false` if that claim no longer holds the task.
    async fn fail_task(&self, task_id: u64, failure: TaskFailure) -> Result<bool, ReactorError>;

    async fn task(&self, task_id: u64) -> Result<Option<ActionTask>, ReactorError>;

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<ActionTask>, ReactorError>;

    async fn count_tasks(&self, status: TaskStatus) -> Result<u64, ReactorError>;
}

// ─── Alarms ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait AlarmStore: Send + Sync {
    /// Record an alarm. Alarms tied to an event are raised once per
    /// `(kind, sequence_id)`; returns `false` for a repeat.
    async fn raise_alarm(&self, alarm: NewAlarm) -> Result<bool, ReactorError>;

    async fn last_alarm(&self) -> Result<Option<Alarm>, ReactorError>;

    async fn alarms(&self) -> Result<Vec<Alarm>, ReactorError>;
}

/// Everything the pipeline needs from one backend.
pub trait ReactorStore:
    LedgerStore + ProjectionStore + ConsumerStore + TriggerStore + TaskStore + AlarmStore
{
}

impl<T> ReactorStore for T where
    T: LedgerStore + ProjectionStore + ConsumerStore + TriggerStore + TaskStore + AlarmStore
{
}
