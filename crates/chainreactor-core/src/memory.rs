//! In-memory store for tests, simulation, and ephemeral pipelines.
//!
//! All state lives behind one mutex, so every trait method (and in particular
//! [`LedgerStore::commit`] and [`TriggerStore::fire`]) is atomic.
//! All data is lost when the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::action::{ActionTask, ClaimBatch, ClaimRequest, NewTask, TaskFailure, TaskStatus, LEASE_EXPIRED};
use crate::alarm::{Alarm, NewAlarm};
use crate::cursor::Cursor;
use crate::error::ReactorError;
use crate::log::CanonicalLog;
use crate::projection::{ProjectionKind, ProjectionRecord, RecordRef, RecordWrite};
use crate::store::{
    AlarmStore, CommitSummary, ConsumerStore, LedgerCommit, LedgerStore, ProjectionStore, SkippedEvent,
    TaskStore, TriggerStore,
};
use crate::trigger::{FireOutcome, FiringStatus, NewFiring, TriggerFiring};
use crate::types::{ChainEvent, EventDraft, EventKey, EventStatus, StoredBlock};

#[derive(Default)]
struct MemoryState {
    cursors: HashMap<String, Cursor>,
    /// Block index keyed by hash.
    blocks: HashMap<String, StoredBlock>,
    events: BTreeMap<u64, ChainEvent>,
    event_keys: HashMap<EventKey, u64>,
    last_sequence_id: u64,
    records: BTreeMap<RecordRef, ProjectionRecord>,
    offsets: HashMap<String, u64>,
    skipped: BTreeMap<(String, u64), SkippedEvent>,
    firings: BTreeMap<u64, TriggerFiring>,
    firing_index: HashMap<(String, u64), u64>,
    tasks: BTreeMap<u64, ActionTask>,
    alarms: Vec<Alarm>,
}

/// Outcome of appending one draft under the lock.
enum Appended {
    New(ChainEvent),
    Existing(ChainEvent),
}

impl MemoryState {
    fn append(&mut self, draft: EventDraft) -> Appended {
        let key = draft.key();
        if let Some(seq) = self.event_keys.get(&key).copied() {
            let block_canonical = self
                .blocks
                .get(&draft.block_hash)
                .is_some_and(|b| !b.orphaned);
            let revivable = self
                .events
                .get(&seq)
                .is_some_and(|e| e.status == EventStatus::Orphaned && !e.revoked);
            if !(revivable && block_canonical) {
                let existing = self.events.get(&seq).cloned();
                return match existing {
                    Some(e) => Appended::Existing(e),
                    None => Appended::New(self.insert(draft)),
                };
            }
            if let Some(mut event) = self.events.remove(&seq) {
                self.last_sequence_id += 1;
                event.sequence_id = self.last_sequence_id;
                event.status = EventStatus::Provisional;
                self.event_keys.insert(key, event.sequence_id);
                self.events.insert(event.sequence_id, event.clone());
                return Appended::New(event);
            }
        }
        Appended::New(self.insert(draft))
    }

    fn insert(&mut self, draft: EventDraft) -> ChainEvent {
        self.last_sequence_id += 1;
        let event = ChainEvent::from_draft(draft, self.last_sequence_id);
        self.event_keys.insert(event.key(), event.sequence_id);
        self.events.insert(event.sequence_id, event.clone());
        event
    }

    /// Returns the number of events changed and the revoked sequence ids.
    fn orphan_blocks(&mut self, hashes: &[String]) -> (u64, Vec<u64>) {
        let mut changed = 0;
        let mut revoked = Vec::new();
        for hash in hashes {
            if let Some(block) = self.blocks.get_mut(hash) {
                block.orphaned = true;
            }
            for event in self.events.values_mut().filter(|e| &e.block_hash == hash) {
                match event.status {
                    EventStatus::Orphaned => continue,
                    EventStatus::Confirmed => {
                        event.revoked = true;
                        revoked.push(event.sequence_id);
                    }
                    EventStatus::Provisional => {}
                }
                event.status = EventStatus::Orphaned;
                changed += 1;
            }
        }
        (changed, revoked)
    }

    fn confirm_up_to(&mut self, height: u64) -> u64 {
        let mut changed = 0;
        for event in self
            .events
            .values_mut()
            .filter(|e| e.status == EventStatus::Provisional && e.block_height <= height)
        {
            event.status = EventStatus::Confirmed;
            changed += 1;
        }
        changed
    }

    fn raise_alarm(&mut self, alarm: NewAlarm) -> bool {
        if let Some(seq) = alarm.sequence_id {
            if self
                .alarms
                .iter()
                .any(|a| a.kind == alarm.kind && a.sequence_id == Some(seq))
            {
                return false;
            }
        }
        let id = self.alarms.len() as u64 + 1;
        self.alarms.push(Alarm::from_new(id, alarm));
        true
    }
}

/// In-memory implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, ReactorError> {
        self.state
            .lock()
            .map_err(|_| ReactorError::Storage("memory store lock poisoned".into()))
    }

    /// Every event in the log, ascending by sequence id.
    pub fn events(&self) -> Result<Vec<ChainEvent>, ReactorError> {
        Ok(self.state()?.events.values().cloned().collect())
    }

    /// Every task, ascending by id.
    pub fn tasks(&self) -> Result<Vec<ActionTask>, ReactorError> {
        Ok(self.state()?.tasks.values().cloned().collect())
    }
}

// ─── Canonical log ────────────────────────────────────────────────────────────

#[async_trait]
impl CanonicalLog for MemoryStore {
    async fn append(&self, draft: EventDraft) -> Result<ChainEvent, ReactorError> {
        Ok(match self.state()?.append(draft) {
            Appended::New(e) | Appended::Existing(e) => e,
        })
    }

    async fn mark_orphaned(&self, block_hashes: &[String]) -> Result<u64, ReactorError> {
        Ok(self.state()?.orphan_blocks(block_hashes).0)
    }

    async fn mark_confirmed(&self, up_to_height: u64) -> Result<u64, ReactorError> {
        Ok(self.state()?.confirm_up_to(up_to_height))
    }

    async fn confirmed_since(&self, after: u64, limit: usize) -> Result<Vec<ChainEvent>, ReactorError> {
        let state = self.state()?;
        Ok(state
            .events
            .range(after.saturating_add(1)..)
            .map(|(_, e)| e)
            .filter(|e| e.status == EventStatus::Confirmed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn event(&self, sequence_id: u64) -> Result<Option<ChainEvent>, ReactorError> {
        Ok(self.state()?.events.get(&sequence_id).cloned())
    }

    async fn event_by_key(&self, key: &EventKey) -> Result<Option<ChainEvent>, ReactorError> {
        let state = self.state()?;
        Ok(state
            .event_keys
            .get(key)
            .and_then(|seq| state.events.get(seq))
            .cloned())
    }

    async fn events_in_block(&self, block_hash: &str) -> Result<Vec<ChainEvent>, ReactorError> {
        let state = self.state()?;
        Ok(state
            .events
            .values()
            .filter(|e| e.block_hash == block_hash)
            .cloned()
            .collect())
    }

    async fn revoked_events(&self) -> Result<Vec<ChainEvent>, ReactorError> {
        let state = self.state()?;
        Ok(state.events.values().filter(|e| e.revoked).cloned().collect())
    }
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn load_cursor(&self, chain: &str) -> Result<Option<Cursor>, ReactorError> {
        Ok(self.state()?.cursors.get(chain).cloned())
    }

    async fn canonical_blocks_from(&self, from_height: u64) -> Result<Vec<StoredBlock>, ReactorError> {
        let state = self.state()?;
        let mut blocks: Vec<StoredBlock> = state
            .blocks
            .values()
            .filter(|b| !b.orphaned && b.height >= from_height)
            .cloned()
            .collect();
        blocks.sort_by_key(|b| b.height);
        Ok(blocks)
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Option<StoredBlock>, ReactorError> {
        Ok(self.state()?.blocks.get(hash).cloned())
    }

    async fn commit(&self, commit: LedgerCommit) -> Result<CommitSummary, ReactorError> {
        let mut state = self.state()?;
        let found = state.cursors.get(&commit.cursor.chain).map_or(0, |c| c.version);
        if found != commit.expected_version {
            return Err(ReactorError::VersionConflict {
                expected: commit.expected_version,
                found,
            });
        }

        let mut summary = CommitSummary::default();
        let (orphaned, revoked) = state.orphan_blocks(&commit.orphan_blocks);
        summary.orphaned = orphaned;
        summary.revoked = revoked;

        for block in commit.adopt_blocks {
            let mut block = block;
            block.orphaned = false;
            state.blocks.insert(block.hash.clone(), block);
        }
        for draft in commit.events {
            match state.append(draft) {
                Appended::New(_) => summary.appended += 1,
                Appended::Existing(_) => summary.duplicates += 1,
            }
        }
        if let Some(height) = commit.confirm_up_to {
            summary.confirmed = state.confirm_up_to(height);
        }
        for alarm in commit.alarms {
            state.raise_alarm(alarm);
        }

        let mut cursor = commit.cursor;
        cursor.version = commit.expected_version + 1;
        summary.cursor_version = cursor.version;
        state.cursors.insert(cursor.chain.clone(), cursor);
        Ok(summary)
    }
}

// ─── Projections ──────────────────────────────────────────────────────────────

#[async_trait]
impl ProjectionStore for MemoryStore {
    async fn load_record(&self, target: &RecordRef) -> Result<Option<ProjectionRecord>, ReactorError> {
        Ok(self.state()?.records.get(target).cloned())
    }

    async fn write_records(&self, writes: Vec<RecordWrite>) -> Result<bool, ReactorError> {
        let mut state = self.state()?;
        let stale = writes.iter().any(|w| {
            state.records.get(&w.target).map(|r| r.last_applied_sequence_id) != w.expected_sequence_id
        });
        if stale {
            return Ok(false);
        }
        for w in writes {
            let record = ProjectionRecord {
                kind: w.target.kind,
                key: w.target.key.clone(),
                state: w.state,
                last_applied_sequence_id: w.sequence_id,
                updated_at: w.updated_at,
            };
            state.records.insert(w.target, record);
        }
        Ok(true)
    }

    async fn records(&self, kind: ProjectionKind) -> Result<Vec<ProjectionRecord>, ReactorError> {
        let state = self.state()?;
        Ok(state
            .records
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect())
    }
}

// ─── Consumers ────────────────────────────────────────────────────────────────

#[async_trait]
impl ConsumerStore for MemoryStore {
    async fn load_offset(&self, consumer: &str) -> Result<u64, ReactorError> {
        Ok(self.state()?.offsets.get(consumer).copied().unwrap_or(0))
    }

    async fn save_offset(&self, consumer: &str, sequence_id: u64) -> Result<(), ReactorError> {
        let mut state = self.state()?;
        let offset = state.offsets.entry(consumer.to_string()).or_insert(0);
        *offset = (*offset).max(sequence_id);
        Ok(())
    }

    async fn record_skipped(&self, skipped: SkippedEvent) -> Result<(), ReactorError> {
        let mut state = self.state()?;
        state
            .skipped
            .entry((skipped.consumer.clone(), skipped.sequence_id))
            .or_insert(skipped);
        Ok(())
    }

    async fn skipped_count(&self) -> Result<u64, ReactorError> {
        Ok(self.state()?.skipped.len() as u64)
    }
}

// ─── Triggers & tasks ─────────────────────────────────────────────────────────

#[async_trait]
impl TriggerStore for MemoryStore {
    async fn fire(&self, firing: NewFiring, task: NewTask) -> Result<FireOutcome, ReactorError> {
        let mut state = self.state()?;
        let index_key = (firing.rule_id.clone(), firing.sequence_id);
        if let Some(firing_id) = state.firing_index.get(&index_key) {
            return Ok(FireOutcome::AlreadyFired { firing_id: *firing_id });
        }

        let firing_id = state.firings.len() as u64 + 1;
        let task_id = state.tasks.len() as u64 + 1;
        state.firing_index.insert(index_key, firing_id);
        state.firings.insert(
            firing_id,
            TriggerFiring {
                firing_id,
                rule_id: firing.rule_id.clone(),
                chain_event_sequence_id: firing.sequence_id,
                fired_at: firing.fired_at,
                status: FiringStatus::Enqueued,
            },
        );
        state.tasks.insert(
            task_id,
            ActionTask {
                task_id,
                trigger_firing_id: firing_id,
                rule_id: firing.rule_id,
                sequence_id: firing.sequence_id,
                action: task.action,
                payload: task.payload,
                idempotency_key: task.idempotency_key,
                attempt: 0,
                next_retry_at: task.next_retry_at,
                lease_until: None,
                status: TaskStatus::Queued,
                last_error: None,
                receipt: None,
                updated_at: firing.fired_at,
            },
        );
        Ok(FireOutcome::Fired { firing_id, task_id })
    }

    async fn firing(&self, rule_id: &str, sequence_id: u64) -> Result<Option<TriggerFiring>, ReactorError> {
        let state = self.state()?;
        Ok(state
            .firing_index
            .get(&(rule_id.to_string(), sequence_id))
            .and_then(|id| state.firings.get(id))
            .cloned())
    }

    async fn firings(&self) -> Result<Vec<TriggerFiring>, ReactorError> {
        Ok(self.state()?.firings.values().cloned().collect())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn claim_due(&self, request: ClaimRequest) -> Result<ClaimBatch, ReactorError> {
        let ClaimRequest {
            now,
            limit,
            lease_until,
            max_attempts,
        } = request;
        let mut state = self.state()?;
        let mut batch = ClaimBatch::default();

        for task in state.tasks.values_mut() {
            let expired = task.status == TaskStatus::Executing && task.lease_until.is_some_and(|l| l <= now);
            if !expired {
                continue;
            }
            task.attempt += 1;
            task.last_error = Some(LEASE_EXPIRED.to_string());
            task.lease_until = None;
            task.updated_at = now;
            if task.attempt >= max_attempts {
                task.status = TaskStatus::Dead;
                batch.dead_lettered.push(task.clone());
            } else {
                task.status = TaskStatus::Failed;
            }
        }

        let mut due: Vec<(i64, u64)> = state
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Queued | TaskStatus::Failed) && t.next_retry_at <= now)
            .map(|t| (t.next_retry_at, t.task_id))
            .collect();
        due.sort_unstable();

        for (_, id) in due.into_iter().take(limit) {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.status = TaskStatus::Executing;
                task.lease_until = Some(lease_until);
                task.updated_at = now;
                batch.tasks.push(task.clone());
            }
        }
        Ok(batch)
    }

    async fn complete_task(&self, task_id: u64, attempt: u32, receipt: &str, at: i64) -> Result<bool, ReactorError> {
        let mut state = self.state()?;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Executing || task.attempt != attempt {
            return Ok(false);
        }
        task.status = TaskStatus::Succeeded;
        task.lease_until = None;
        task.receipt = Some(receipt.to_string());
        task.updated_at = at;
        let firing_id = task.trigger_firing_id;
        if let Some(firing) = state.firings.get_mut(&firing_id) {
            firing.status = FiringStatus::Completed;
        }
        Ok(true)
    }

    async fn fail_task(&self, task_id: u64, failure: TaskFailure) -> Result<bool, ReactorError> {
        let mut state = self.state()?;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Executing || task.attempt + 1 != failure.attempt {
            return Ok(false);
        }
        task.attempt = failure.attempt;
        task.status = failure.status;
        task.next_retry_at = failure.next_retry_at;
        task.last_error = Some(failure.error);
        task.lease_until = None;
        task.updated_at = failure.at;
        Ok(true)
    }

    async fn task(&self, task_id: u64) -> Result<Option<ActionTask>, ReactorError> {
        Ok(self.state()?.tasks.get(&task_id).cloned())
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<ActionTask>, ReactorError> {
        let state = self.state()?;
        Ok(state.tasks.values().filter(|t| t.status == status).cloned().collect())
    }

    async fn count_tasks(&self, status: TaskStatus) -> Result<u64, ReactorError> {
        let state = self.state()?;
        Ok(state.tasks.values().filter(|t| t.status == status).count() as u64)
    }
}

// ─── Alarms ───────────────────────────────────────────────────────────────────

#[async_trait]
impl AlarmStore for MemoryStore {
    async fn raise_alarm(&self, alarm: NewAlarm) -> Result<bool, ReactorError> {
        Ok(self.state()?.raise_alarm(alarm))
    }

    async fn last_alarm(&self) -> Result<Option<Alarm>, ReactorError> {
        Ok(self.state()?.alarms.last().cloned())
    }

    async fn alarms(&self) -> Result<Vec<Alarm>, ReactorError> {
        Ok(self.state()?.alarms.clone())
    }
}
