//! Canonical log — the durable, append-only, deduplicated record of every
//! observed chain event, whatever its confirmation status.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};

use crate::error::ReactorError;
use crate::types::{ChainEvent, EventDraft, EventKey};

/// Storage contract for the canonical log.
///
/// Status transitions (`mark_*`) are driven only by the reconciler.
#[async_trait]
pub trait CanonicalLog: Send + Sync {
    /// Persist a draft as a provisional event.
    ///
    /// If the idempotency key is already present the existing record is
    /// returned unchanged. The one exception is an orphaned (never confirmed)
    /// event whose block was re-adopted: it is revived as provisional under a
    /// fresh sequence id, so consumers positioned past its old id still see it.
    async fn append(&self, draft: EventDraft) -> Result<ChainEvent, ReactorError>;

    /// Orphan every block in `block_hashes` and its events. Confirmed events
    /// become orphaned with `revoked = true`. Returns the number of events changed.
    async fn mark_orphaned(&self, block_hashes: &[String]) -> Result<u64, ReactorError>;

    /// Confirm every provisional event at or below `up_to_height`.
    /// Returns the number of events changed.
    async fn mark_confirmed(&self, up_to_height: u64) -> Result<u64, ReactorError>;

    /// Confirmed events with `sequence_id > after`, ascending, at most `limit`.
    async fn confirmed_since(&self, after: u64, limit: usize) -> Result<Vec<ChainEvent>, ReactorError>;

    async fn event(&self, sequence_id: u64) -> Result<Option<ChainEvent>, ReactorError>;

    async fn event_by_key(&self, key: &EventKey) -> Result<Option<ChainEvent>, ReactorError>;

    /// Events of one block, ascending by sequence id.
    async fn events_in_block(&self, block_hash: &str) -> Result<Vec<ChainEvent>, ReactorError>;

    /// Events that went confirmed → orphaned.
    async fn revoked_events(&self) -> Result<Vec<ChainEvent>, ReactorError>;
}

/// Lazily stream confirmed events after `after`, fetching `batch` at a time.
///
/// The stream holds no position of its own beyond the last id it yielded;
/// callers persist their watermark and restart from it.
pub fn stream_confirmed_since<'a, L>(
    log: &'a L,
    after: u64,
    batch: usize,
) -> impl Stream<Item = Result<ChainEvent, ReactorError>> + 'a
where
    L: CanonicalLog + ?Sized,
{
    let batch = batch.max(1);
    stream::unfold(Some(after), move |state| async move {
        let after = state?;
        match log.confirmed_since(after, batch).await {
            Ok(events) if events.is_empty() => None,
            Ok(events) => {
                let last = events.last().map(|e| e.sequence_id).unwrap_or(after);
                let next = (events.len() == batch).then_some(last);
                let items: Vec<Result<ChainEvent, ReactorError>> = events.into_iter().map(Ok).collect();
                Some((stream::iter(items), next))
            }
            Err(e) => Some((stream::iter(vec![Err(e)]), None)),
        }
    })
    .flatten()
}
