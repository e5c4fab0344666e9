//! Reconciler — turns untrusted block deliveries into canonical log updates.
//!
//! Every pass:
//! 1. Loads the durable cursor and the recent canonical block window
//! 2. Classifies each delivered block (duplicate, extension, gap, fork, stale)
//! 3. Resolves forks by walking back to a common ancestor (longest chain wins)
//! 4. Confirms events that reached `finality_depth`
//! 5. Commits everything as one [`LedgerCommit`]
//!
//! Nothing is written until the end of a pass, so a pass that fails or is
//! cancelled leaves the store exactly as it found it.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::alarm::{AlarmKind, NewAlarm};
use crate::config::PipelineConfig;
use crate::cursor::{finality_height, Cursor};
use crate::error::ReactorError;
use crate::metrics::ReactorMetrics;
use crate::source::ChainSource;
use crate::store::{AlarmStore, LedgerCommit, LedgerStore};
use crate::tracker::BlockTracker;
use crate::types::{now_ms, EventDraft, RemoteBlock, StoredBlock};

// ─── Reorg reporting ──────────────────────────────────────────────────────────

/// Classification of a resolved fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReorgType {
    /// Up to three local blocks replaced.
    ShortReorg,
    /// More than three local blocks replaced.
    DeepReorg,
    /// The common ancestor is below the confirmed height.
    BelowFinality,
}

impl std::fmt::Display for ReorgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortReorg => write!(f, "short reorg"),
            Self::DeepReorg => write!(f, "deep reorg"),
            Self::BelowFinality => write!(f, "reorg below finality"),
        }
    }
}

/// Describes a fork the reconciler switched to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgEvent {
    /// Height of the first block of the winning branch.
    pub detected_at: u64,
    /// Height of the common ancestor.
    pub common_ancestor: u64,
    /// Local blocks that were replaced, most recent first.
    pub dropped_blocks: Vec<StoredBlock>,
    /// Number of local blocks replaced.
    pub depth: u64,
    pub reorg_type: ReorgType,
}

/// What one [`Reconciler::observe`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Blocks that became canonical.
    pub adopted: u64,
    /// Blocks already known.
    pub duplicates: u64,
    /// Blocks ignored: stale ancestry or a losing fork.
    pub stale: u64,
    /// Events newly appended (or revived).
    pub appended: u64,
    /// Events orphaned by a reorg.
    pub orphaned: u64,
    /// Events that became confirmed.
    pub confirmed: u64,
    /// First missing height when the batch skipped ahead of the tip.
    pub gap_from: Option<u64>,
    pub reorg: Option<ReorgEvent>,
    /// Confirmed events that were orphaned by this pass.
    pub revoked: Vec<u64>,
    /// Cursor as committed.
    pub cursor: Option<Cursor>,
}

// ─── Pass state ───────────────────────────────────────────────────────────────

/// Uncommitted changes accumulated during one pass.
#[derive(Default)]
struct Pass {
    adopt: Vec<StoredBlock>,
    drafts: Vec<EventDraft>,
    /// Hashes adopted during this pass (not yet durable).
    pending: HashSet<String>,
    /// Previously committed blocks to orphan.
    orphan: Vec<String>,
    alarms: Vec<NewAlarm>,
    outcome: ReconcileOutcome,
}

impl Pass {
    fn adopt(&mut self, block: &RemoteBlock, tracker: &mut BlockTracker, observed_at: i64) -> Result<(), ReactorError> {
        let summary = block.summary();
        tracker.push(summary.clone()).map_err(|depth| {
            ReactorError::Other(format!(
                "block {} at height {} does not extend the local tip (depth {depth})",
                block.hash, block.height
            ))
        })?;
        self.pending.insert(summary.hash.clone());
        self.adopt.push(summary);
        self.drafts.extend(block.drafts(observed_at));
        self.outcome.adopted += 1;
        Ok(())
    }

    /// Drop blocks above `height` from the tracker, un-adopting pending ones
    /// and orphaning committed ones.
    fn rewind(&mut self, tracker: &mut BlockTracker, height: u64) -> Vec<StoredBlock> {
        let dropped = tracker.rewind_to(height);
        for block in &dropped {
            if self.pending.remove(&block.hash) {
                self.adopt.retain(|b| b.hash != block.hash);
                self.drafts.retain(|d| d.block_hash != block.hash);
                self.outcome.adopted = self.outcome.adopted.saturating_sub(1);
            } else {
                self.orphan.push(block.hash.clone());
            }
        }
        dropped
    }

    fn is_empty(&self) -> bool {
        self.adopt.is_empty() && self.orphan.is_empty() && self.alarms.is_empty()
    }
}

// ─── Reconciler ───────────────────────────────────────────────────────────────

/// Sole writer of the cursor and of event status.
pub struct Reconciler<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    source: Arc<C>,
    chain: String,
    finality_depth: u64,
    lookback_window: u64,
    metrics: ReactorMetrics,
}

impl<S, C> Reconciler<S, C>
where
    S: LedgerStore + AlarmStore + ?Sized,
    C: ChainSource + ?Sized,
{
    pub fn new(store: Arc<S>, source: Arc<C>, config: &PipelineConfig) -> Self {
        Self {
            store,
            source,
            chain: config.chain.clone(),
            finality_depth: config.finality_depth,
            lookback_window: config.lookback_window.max(1),
            metrics: ReactorMetrics::global(),
        }
    }

    pub fn with_metrics(mut self, metrics: ReactorMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub async fn cursor(&self) -> Result<Option<Cursor>, ReactorError> {
        self.store.load_cursor(&self.chain).await
    }

    /// Reconcile a batch of delivered blocks against the local chain.
    pub async fn observe(&self, blocks: Vec<RemoteBlock>) -> Result<ReconcileOutcome, ReactorError> {
        self.reconcile(blocks, None).await
    }

    /// Like [`observe`](Self::observe), also recording the source's reported
    /// head so lag is measured against the real chain tip.
    pub async fn observe_with_head(
        &self,
        blocks: Vec<RemoteBlock>,
        head_height: u64,
    ) -> Result<ReconcileOutcome, ReactorError> {
        self.reconcile(blocks, Some(head_height)).await
    }

    async fn reconcile(
        &self,
        blocks: Vec<RemoteBlock>,
        head_height: Option<u64>,
    ) -> Result<ReconcileOutcome, ReactorError> {
        let loaded = self.store.load_cursor(&self.chain).await?;
        let expected_version = loaded.as_ref().map_or(0, |c| c.version);
        let original = loaded.unwrap_or_else(|| Cursor::new(self.chain.clone()));
        if let Some(reason) = &original.halted {
            return Err(ReactorError::Halted { reason: reason.clone() });
        }
        let mut cursor = original.clone();
        if let Some(head) = head_height {
            cursor.observed_tip_height = cursor.observed_tip_height.max(head);
        }

        let window = if cursor.is_anchored() {
            let from = cursor.watermark_height.saturating_sub(self.lookback_window);
            self.store.canonical_blocks_from(from).await?
        } else {
            Vec::new()
        };
        let capacity = self.lookback_window as usize + blocks.len() + 1;
        let mut tracker = BlockTracker::from_blocks(window, capacity);

        let mut blocks = blocks;
        blocks.sort_by_key(|b| b.height);
        let observed_at = now_ms();
        let mut pass = Pass::default();
        let mut finality_violated = false;

        let mut i = 0;
        while i < blocks.len() {
            let block = &blocks[i];
            i += 1;
            cursor.observed_tip_height = cursor.observed_tip_height.max(block.height);

            if tracker.contains_hash(&block.hash) {
                pass.outcome.duplicates += 1;
                continue;
            }
            let Some(head) = tracker.head().cloned() else {
                tracing::info!(chain = %self.chain, height = block.height, hash = %block.hash, "anchoring chain");
                pass.adopt(block, &mut tracker, observed_at)?;
                continue;
            };
            if block.extends(&head) {
                pass.adopt(block, &mut tracker, observed_at)?;
                continue;
            }
            if block.height > head.height + 1 {
                tracing::debug!(chain = %self.chain, tip = head.height, got = block.height, "gap in delivered blocks");
                pass.outcome.gap_from = Some(head.height + 1);
                break;
            }
            let floor = tracker.floor().map_or(0, |b| b.height);
            if block.height <= floor {
                if self.store.block_by_hash(&block.hash).await?.is_some() {
                    pass.outcome.duplicates += 1;
                } else {
                    tracing::debug!(chain = %self.chain, height = block.height, hash = %block.hash, "ignoring stale block");
                    pass.outcome.stale += 1;
                }
                continue;
            }

            // Fork: find where the delivered branch meets the local chain.
            let (ancestor, mut branch) = match self.find_ancestor(block, &tracker, floor).await? {
                Some(found) => found,
                None => return Err(self.halt_on_deep_reorg(&original, expected_version, block).await?),
            };
            while i < blocks.len() {
                let Some(last) = branch.last() else { break };
                if blocks[i].parent_hash == last.hash && blocks[i].height == last.height + 1 {
                    branch.push(blocks[i].clone());
                    i += 1;
                } else if blocks[i].hash == last.hash {
                    i += 1;
                } else {
                    break;
                }
            }

            let branch_tip = branch.last().map_or(0, |b| b.height);
            if branch_tip <= head.height {
                tracing::debug!(
                    chain = %self.chain,
                    branch_tip,
                    local_tip = head.height,
                    "fork is not longer than the local chain, keeping local"
                );
                pass.outcome.stale += branch.len() as u64;
                continue;
            }

            let dropped = pass.rewind(&mut tracker, ancestor.height);
            let depth = dropped.len() as u64;
            let below_finality = cursor.has_confirmed() && ancestor.height < cursor.last_confirmed_height;
            let reorg_type = if below_finality {
                ReorgType::BelowFinality
            } else if depth <= 3 {
                ReorgType::ShortReorg
            } else {
                ReorgType::DeepReorg
            };
            tracing::warn!(
                chain = %self.chain,
                depth,
                ancestor = ancestor.height,
                new_tip = branch_tip,
                reorg_type = %reorg_type,
                "Reorg detected"
            );
            for b in &branch {
                pass.adopt(b, &mut tracker, observed_at)?;
            }
            pass.outcome.reorg = Some(ReorgEvent {
                detected_at: ancestor.height + 1,
                common_ancestor: ancestor.height,
                dropped_blocks: dropped,
                depth,
                reorg_type,
            });

            if below_finality {
                let message = format!(
                    "reorg to ancestor {} ({}) is below confirmed height {}",
                    ancestor.height, ancestor.hash, cursor.last_confirmed_height
                );
                tracing::error!(chain = %self.chain, %message, "finality violated, halting confirmations");
                pass.alarms.push(NewAlarm::new(AlarmKind::FinalityViolated, message.clone(), now_ms()));
                cursor.confirm(ancestor.height, ancestor.hash.clone());
                cursor.halt(message);
                finality_violated = true;
                break;
            }
        }

        if let Some(head) = tracker.head() {
            cursor.advance_tip(head.height, head.hash.clone());
        }

        let mut confirm_up_to = None;
        if !finality_violated {
            if let Some(final_height) = finality_height(cursor.watermark_height, self.finality_depth) {
                if !cursor.has_confirmed() || final_height > cursor.last_confirmed_height {
                    if let Some(b) = tracker.at_or_below(final_height) {
                        cursor.confirm(b.height, b.hash.clone());
                        confirm_up_to = Some(final_height);
                    }
                }
            }
        }

        if pass.is_empty() && confirm_up_to.is_none() && cursor == original {
            pass.outcome.cursor = Some(original);
            return Ok(pass.outcome);
        }

        let mut outcome = pass.outcome;
        let alarm_kinds: Vec<AlarmKind> = pass.alarms.iter().map(|a| a.kind).collect();
        let commit = LedgerCommit {
            expected_version,
            cursor: cursor.clone(),
            orphan_blocks: pass.orphan,
            adopt_blocks: pass.adopt,
            events: pass.drafts,
            confirm_up_to,
            alarms: pass.alarms,
        };
        let summary = self.store.commit(commit).await?;
        cursor.version = summary.cursor_version;
        for kind in alarm_kinds {
            self.metrics.record_alarm(kind);
        }

        outcome.appended = summary.appended;
        outcome.orphaned = summary.orphaned;
        outcome.confirmed = summary.confirmed;
        outcome.revoked = summary.revoked;
        if outcome.confirmed > 0 {
            tracing::info!(
                chain = %self.chain,
                confirmed = outcome.confirmed,
                height = cursor.last_confirmed_height,
                "events confirmed"
            );
        }
        tracing::debug!(
            chain = %self.chain,
            tip = cursor.watermark_height,
            adopted = outcome.adopted,
            appended = outcome.appended,
            version = cursor.version,
            "reconcile pass committed"
        );
        outcome.cursor = Some(cursor);
        Ok(outcome)
    }

    /// Walk back from `block` to the nearest block in the local window.
    ///
    /// Returns the ancestor and the delivered branch above it (ascending),
    /// or `None` when no ancestor exists inside the window.
    async fn find_ancestor(
        &self,
        block: &RemoteBlock,
        tracker: &BlockTracker,
        floor: u64,
    ) -> Result<Option<(StoredBlock, Vec<RemoteBlock>)>, ReactorError> {
        let mut branch = vec![block.clone()];
        loop {
            let Some(child) = branch.last() else { return Ok(None) };
            if let Some(ancestor) = tracker.find_hash(&child.parent_hash) {
                if ancestor.height + 1 != child.height {
                    return Err(ReactorError::Source(format!(
                        "block {} at height {} names parent {} at height {}",
                        child.hash, child.height, ancestor.hash, ancestor.height
                    )));
                }
                let ancestor = ancestor.clone();
                branch.reverse();
                return Ok(Some((ancestor, branch)));
            }
            let parent_height = child.height.saturating_sub(1);
            if parent_height <= floor || branch.len() as u64 > self.lookback_window {
                return Ok(None);
            }
            let parent = self
                .source
                .block_by_hash(&child.parent_hash)
                .await?
                .ok_or_else(|| ReactorError::Source(format!("parent block {} not found", child.parent_hash)))?;
            if parent.height != parent_height {
                return Err(ReactorError::Source(format!(
                    "block {} reported at height {}, expected {parent_height}",
                    parent.hash, parent.height
                )));
            }
            branch.push(parent);
        }
    }

    /// Record the halt and alarm, and build the error to return.
    async fn halt_on_deep_reorg(
        &self,
        original: &Cursor,
        expected_version: u64,
        block: &RemoteBlock,
    ) -> Result<ReactorError, ReactorError> {
        let err = ReactorError::ReorgDepthExceeded {
            height: block.height,
            hash: block.hash.clone(),
            lookback: self.lookback_window,
        };
        tracing::error!(chain = %self.chain, height = block.height, hash = %block.hash, "{err}");
        let mut halted = original.clone();
        halted.halt(err.to_string());
        let mut commit = LedgerCommit::cursor_only(expected_version, halted);
        commit
            .alarms
            .push(NewAlarm::new(AlarmKind::ReorgDepthExceeded, err.to_string(), now_ms()));
        self.store.commit(commit).await?;
        self.metrics.record_alarm(AlarmKind::ReorgDepthExceeded);
        Ok(err)
    }

    /// Clear a halt after operator intervention. Returns the updated cursor.
    pub async fn resume(&self) -> Result<Cursor, ReactorError> {
        let loaded = self.store.load_cursor(&self.chain).await?;
        let Some(mut cursor) = loaded else {
            return Err(ReactorError::Other(format!("no cursor for chain '{}'", self.chain)));
        };
        if !cursor.is_halted() {
            return Ok(cursor);
        }
        let version = cursor.version;
        tracing::warn!(chain = %self.chain, reason = ?cursor.halted, "resuming halted reconciler");
        cursor.halted = None;
        let summary = self.store.commit(LedgerCommit::cursor_only(version, cursor.clone())).await?;
        cursor.version = summary.cursor_version;
        Ok(cursor)
    }

    /// Re-anchor the chain at the source's block at `height`.
    ///
    /// Local canonical blocks at or above `height` that differ from the new
    /// anchor are orphaned, the confirmed position is lowered to the anchor if
    /// it was above it, and any halt is cleared.
    pub async fn resync(&self, height: u64) -> Result<Cursor, ReactorError> {
        let anchor = self
            .source
            .block_by_height(height)
            .await?
            .ok_or_else(|| ReactorError::Source(format!("no block at height {height}")))?;
        let loaded = self.store.load_cursor(&self.chain).await?;
        let expected_version = loaded.as_ref().map_or(0, |c| c.version);
        let mut cursor = loaded.unwrap_or_else(|| Cursor::new(self.chain.clone()));

        let local = self.store.canonical_blocks_from(height).await?;
        let already_canonical = local.iter().any(|b| b.hash == anchor.hash);
        let orphan_blocks: Vec<String> = local
            .into_iter()
            .filter(|b| b.hash != anchor.hash)
            .map(|b| b.hash)
            .collect();

        let mut commit = LedgerCommit::cursor_only(expected_version, cursor.clone());
        commit.orphan_blocks = orphan_blocks;
        if !already_canonical {
            commit.adopt_blocks.push(anchor.summary());
            commit.events = anchor.drafts(now_ms());
        }

        cursor.advance_tip(anchor.height, anchor.hash.clone());
        if cursor.has_confirmed() && cursor.last_confirmed_height >= anchor.height {
            tracing::warn!(
                chain = %self.chain,
                from = cursor.last_confirmed_height,
                to = anchor.height,
                "lowering confirmed height to the new anchor"
            );
            cursor.confirm(anchor.height, anchor.hash.clone());
        }
        cursor.halted = None;
        commit.cursor = cursor.clone();

        tracing::warn!(chain = %self.chain, height, hash = %anchor.hash, orphaned = commit.orphan_blocks.len(), "resyncing cursor");
        let summary = self.store.commit(commit).await?;
        cursor.version = summary.cursor_version;
        Ok(cursor)
    }
}
