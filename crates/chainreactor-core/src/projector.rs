//! Projector — applies confirmed events to the domain projections, each
//! effectively once, in `sequence_id` order.

use std::sync::Arc;

use crate::alarm::{AlarmKind, NewAlarm};
use crate::error::ReactorError;
use crate::log::CanonicalLog;
use crate::metrics::ReactorMetrics;
use crate::projection::DomainEvent;
use crate::store::{AlarmStore, ConsumerStore, ProjectionStore, SkippedEvent};
use crate::types::{now_ms, ChainEvent};

/// Consumer name used for the projector's watermark.
pub const PROJECTOR_CONSUMER: &str = "projector";

/// Lost compare-and-set races tolerated per event before giving up.
const MAX_CAS_RETRIES: usize = 8;

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Records written.
    Applied { records: usize },
    /// Every target record already reflects this event.
    AlreadyApplied,
    /// Unknown kind, malformed payload, or inconsistent with current state.
    Skipped { reason: String },
    /// Provisional or orphaned events are never projected.
    NotConfirmed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectorReport {
    pub applied: u64,
    pub already_applied: u64,
    pub skipped: u64,
    /// Offset after the batch.
    pub offset: u64,
    /// New `projection_diverged` alarms.
    pub divergences: u64,
}

pub struct Projector<S: ?Sized> {
    store: Arc<S>,
    batch_size: usize,
    metrics: ReactorMetrics,
}

impl<S> Projector<S>
where
    S: CanonicalLog + ProjectionStore + ConsumerStore + AlarmStore + ?Sized,
{
    pub fn new(store: Arc<S>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            metrics: ReactorMetrics::global(),
        }
    }

    pub fn with_metrics(mut self, metrics: ReactorMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Apply one event to every record it touches.
    pub async fn apply(&self, event: &ChainEvent) -> Result<ApplyOutcome, ReactorError> {
        if !event.is_confirmed() {
            return Ok(ApplyOutcome::NotConfirmed);
        }
        let domain = match DomainEvent::decode(&event.kind, &event.payload) {
            Ok(d) => d,
            Err(reason) => return self.skip(event, reason).await,
        };
        let targets = domain.targets();

        for attempt in 0..MAX_CAS_RETRIES {
            let mut current = Vec::with_capacity(targets.len());
            for target in &targets {
                current.push(self.store.load_record(target).await?);
            }
            let ahead = current
                .iter()
                .filter(|r| r.as_ref().is_some_and(|r| r.last_applied_sequence_id >= event.sequence_id))
                .count();
            if ahead == current.len() {
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            if ahead > 0 {
                return self.diverged(event, ahead, current.len()).await;
            }

            let writes = match domain.reduce(&current, event.sequence_id, now_ms()) {
                Ok(w) => w,
                Err(reason) => return self.skip(event, reason).await,
            };
            let records = writes.len();
            if self.store.write_records(writes).await? {
                tracing::debug!(seq = event.sequence_id, kind = %event.kind, records, "event projected");
                return Ok(ApplyOutcome::Applied { records });
            }
            tracing::debug!(seq = event.sequence_id, attempt, "projection write raced, retrying");
        }
        Err(ReactorError::Storage(format!(
            "projection of event {} kept losing compare-and-set",
            event.sequence_id
        )))
    }

    /// Some target records already reflect the event and others do not.
    async fn diverged(&self, event: &ChainEvent, ahead: usize, total: usize) -> Result<ApplyOutcome, ReactorError> {
        let reason = format!(
            "event {} ({}) is reflected in only {ahead} of {total} records",
            event.sequence_id, event.kind
        );
        let alarm = NewAlarm::new(AlarmKind::ProjectionDiverged, reason.clone(), now_ms()).for_event(event.sequence_id);
        if self.store.raise_alarm(alarm).await? {
            tracing::error!(seq = event.sequence_id, kind = %event.kind, ahead, total, "partially applied event");
            self.metrics.record_alarm(AlarmKind::ProjectionDiverged);
        }
        self.skip(event, reason).await
    }

    async fn skip(&self, event: &ChainEvent, reason: String) -> Result<ApplyOutcome, ReactorError> {
        tracing::warn!(seq = event.sequence_id, kind = %event.kind, %reason, "skipping event");
        self.store
            .record_skipped(SkippedEvent {
                consumer: PROJECTOR_CONSUMER.to_string(),
                sequence_id: event.sequence_id,
                reason: reason.clone(),
                recorded_at: now_ms(),
            })
            .await?;
        self.metrics.record_skipped(PROJECTOR_CONSUMER);
        Ok(ApplyOutcome::Skipped { reason })
    }

    /// Project the next batch of confirmed events after the saved offset.
    pub async fn run_once(&self) -> Result<ProjectorReport, ReactorError> {
        let offset = self.store.load_offset(PROJECTOR_CONSUMER).await?;
        let events = self.store.confirmed_since(offset, self.batch_size).await?;
        let mut report = ProjectorReport {
            offset,
            ..Default::default()
        };

        for event in &events {
            match self.apply(event).await? {
                ApplyOutcome::Applied { .. } => report.applied += 1,
                ApplyOutcome::AlreadyApplied => report.already_applied += 1,
                ApplyOutcome::Skipped { .. } => report.skipped += 1,
                ApplyOutcome::NotConfirmed => {}
            }
            report.offset = event.sequence_id;
        }
        if report.offset > offset {
            self.store.save_offset(PROJECTOR_CONSUMER, report.offset).await?;
        }
        report.divergences = self.check_revocations().await?;
        Ok(report)
    }

    /// Raise a `projection_diverged` alarm for each revoked event the
    /// projector had already consumed. Returns the number of new alarms.
    pub async fn check_revocations(&self) -> Result<u64, ReactorError> {
        let offset = self.store.load_offset(PROJECTOR_CONSUMER).await?;
        let mut raised = 0;
        for event in self.store.revoked_events().await? {
            if event.sequence_id > offset {
                continue;
            }
            let message = format!(
                "event {} ({}) at height {} was applied and later revoked by a reorg",
                event.sequence_id, event.kind, event.block_height
            );
            let alarm = NewAlarm::new(AlarmKind::ProjectionDiverged, message, now_ms()).for_event(event.sequence_id);
            if self.store.raise_alarm(alarm).await? {
                tracing::error!(seq = event.sequence_id, kind = %event.kind, "projection diverged from chain");
                self.metrics.record_alarm(AlarmKind::ProjectionDiverged);
                raised += 1;
            }
        }
        Ok(raised)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::cursor::Cursor;
    use crate::memory::MemoryStore;
    use crate::projection::{NftOwnership, ProjectionKind, RecordRef, RecordWrite};
    use crate::store::{LedgerCommit, LedgerStore};
    use crate::types::{EventDraft, StoredBlock};

    fn draft(height: u64, index: u32, kind: &str, payload: Value) -> EventDraft {
        EventDraft {
            block_height: height,
            block_hash: format!("0x{height}"),
            tx_signature: format!("sig-{height}"),
            logical_index: index,
            kind: kind.into(),
            payload,
            observed_at: 0,
        }
    }

    /// Commit `events` in block 1 and confirm them.
    async fn seed(store: &MemoryStore, events: Vec<EventDraft>, confirm: bool) {
        let mut cursor = Cursor::new("test");
        cursor.advance_tip(1, "0x1");
        let mut commit = LedgerCommit::cursor_only(0, cursor);
        commit.adopt_blocks = vec![StoredBlock {
            height: 1,
            hash: "0x1".into(),
            parent_hash: "0x0".into(),
            timestamp: 0,
            orphaned: false,
        }];
        commit.events = events;
        commit.confirm_up_to = confirm.then_some(1);
        store.commit(commit).await.unwrap();
    }

    fn owner_of(records: &[crate::projection::ProjectionRecord], token: &str) -> Option<String> {
        records
            .iter()
            .find(|r| r.key == token)
            .and_then(|r| r.decode::<NftOwnership>().ok())
            .and_then(|s| s.owner)
    }

    #[tokio::test]
    async fn applies_confirmed_events_in_order() {
        let store = Arc::new(MemoryStore::new());
        seed(
            &store,
            vec![
                draft(1, 0, "nft_minted", json!({"token_id": "1", "owner": "alice"})),
                draft(1, 1, "nft_transferred", json!({"token_id": "1", "from": "alice", "to": "bob"})),
            ],
            true,
        )
        .await;

        let projector = Projector::new(Arc::clone(&store), 10);
        let report = projector.run_once().await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.offset, 2);

        let records = store.records(ProjectionKind::NftOwnership).await.unwrap();
        assert_eq!(owner_of(&records, "1").as_deref(), Some("bob"));
        assert_eq!(records[0].last_applied_sequence_id, 2);

        let again = projector.run_once().await.unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.offset, 2);
    }

    #[tokio::test]
    async fn replaying_an_event_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        seed(
            &store,
            vec![
                draft(1, 0, "nft_minted", json!({"token_id": "1", "owner": "alice"})),
                draft(1, 1, "nft_transferred", json!({"token_id": "1", "from": "alice", "to": "bob"})),
            ],
            true,
        )
        .await;
        let projector = Projector::new(Arc::clone(&store), 10);
        projector.run_once().await.unwrap();

        let mint = store.event(1).await.unwrap().unwrap();
        assert_eq!(projector.apply(&mint).await.unwrap(), ApplyOutcome::AlreadyApplied);
        let record = store
            .load_record(&RecordRef::new(ProjectionKind::NftOwnership, "1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.last_applied_sequence_id, 2);
    }

    #[tokio::test]
    async fn provisional_events_are_never_applied() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, vec![draft(1, 0, "nft_minted", json!({"token_id": "1", "owner": "alice"}))], false).await;
        let projector = Projector::new(Arc::clone(&store), 10);

        let event = store.event(1).await.unwrap().unwrap();
        assert_eq!(projector.apply(&event).await.unwrap(), ApplyOutcome::NotConfirmed);
        assert_eq!(projector.run_once().await.unwrap().applied, 0);
        assert!(store.records(ProjectionKind::NftOwnership).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_kinds_are_skipped_and_audited() {
        let store = Arc::new(MemoryStore::new());
        seed(
            &store,
            vec![
                draft(1, 0, "studio_created", json!({"studio": "x"})),
                draft(1, 1, "nft_minted", json!({"token_id": "1", "owner": "alice"})),
            ],
            true,
        )
        .await;
        let projector = Projector::new(Arc::clone(&store), 10);
        let report = projector.run_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(store.skipped_count().await.unwrap(), 1);
        assert_eq!(store.load_offset(PROJECTOR_CONSUMER).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn revoked_applied_event_raises_one_alarm() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, vec![draft(1, 0, "nft_minted", json!({"token_id": "1", "owner": "alice"}))], true).await;
        let projector = Projector::new(Arc::clone(&store), 10);
        projector.run_once().await.unwrap();

        let mut reorg = LedgerCommit::cursor_only(1, Cursor::new("test"));
        reorg.orphan_blocks = vec!["0x1".into()];
        store.commit(reorg).await.unwrap();

        assert_eq!(projector.run_once().await.unwrap().divergences, 1);
        assert_eq!(projector.check_revocations().await.unwrap(), 0);
        let alarm = store.last_alarm().await.unwrap().unwrap();
        assert_eq!(alarm.kind, AlarmKind::ProjectionDiverged);
        assert_eq!(alarm.sequence_id, Some(1));
    }

    #[tokio::test]
    async fn vote_against_advanced_tally_is_skipped_with_alarm() {
        let store = Arc::new(MemoryStore::new());
        seed(
            &store,
            vec![draft(1, 0, "vote_cast", json!({"proposal_id": "P1", "voter": "alice", "choice": "for", "weight": 10}))],
            true,
        )
        .await;
        let tally = RecordWrite {
            target: RecordRef::new(ProjectionKind::ProposalTally, "P1"),
            expected_sequence_id: None,
            state: json!({"proposal_id": "P1", "for_weight": 3, "against_weight": 0, "abstain_weight": 0, "voters": 1}),
            sequence_id: 5,
            updated_at: 0,
        };
        assert!(store.write_records(vec![tally]).await.unwrap());

        let projector = Projector::new(Arc::clone(&store), 10);
        let vote = store.event(1).await.unwrap().unwrap();
        assert!(matches!(projector.apply(&vote).await.unwrap(), ApplyOutcome::Skipped { .. }));

        assert!(store.records(ProjectionKind::Vote).await.unwrap().is_empty());
        let tally = store
            .load_record(&RecordRef::new(ProjectionKind::ProposalTally, "P1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tally.last_applied_sequence_id, 5);
        assert_eq!(tally.state["for_weight"], 3);
        assert_eq!(store.skipped_count().await.unwrap(), 1);
        let alarm = store.last_alarm().await.unwrap().unwrap();
        assert_eq!(alarm.kind, AlarmKind::ProjectionDiverged);
        assert_eq!(alarm.sequence_id, Some(1));
    }
}
