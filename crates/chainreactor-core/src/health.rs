//! Operator health surface.

use serde::{Deserialize, Serialize};

use crate::action::TaskStatus;
use crate::alarm::Alarm;
use crate::error::ReactorError;
use crate::store::{AlarmStore, ConsumerStore, LedgerStore, TaskStore};

/// Point-in-time view of one chain's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub chain: String,
    /// Height of the local canonical tip.
    pub cursor_height: u64,
    /// Highest confirmed block height.
    pub confirmed_height: u64,
    /// Blocks between the local tip and the highest height the source reported.
    pub lag_behind_tip: u64,
    pub dead_task_count: u64,
    pub queued_task_count: u64,
    pub skipped_event_count: u64,
    /// Recovery-required reason, if the reconciler is halted.
    pub halted: Option<String>,
    pub last_alarm: Option<Alarm>,
}

impl HealthReport {
    /// Returns `true` when nothing needs an operator.
    pub fn is_healthy(&self) -> bool {
        self.halted.is_none() && self.dead_task_count == 0
    }
}

/// Build a [`HealthReport`] from the store.
pub async fn health_report<S>(store: &S, chain: &str) -> Result<HealthReport, ReactorError>
where
    S: LedgerStore + TaskStore + ConsumerStore + AlarmStore + ?Sized,
{
    let cursor = store.load_cursor(chain).await?;
    let queued = store.count_tasks(TaskStatus::Queued).await? + store.count_tasks(TaskStatus::Failed).await?;
    Ok(HealthReport {
        chain: chain.to_string(),
        cursor_height: cursor.as_ref().map_or(0, |c| c.watermark_height),
        confirmed_height: cursor.as_ref().map_or(0, |c| c.last_confirmed_height),
        lag_behind_tip: cursor.as_ref().map_or(0, |c| c.lag_behind_tip()),
        dead_task_count: store.count_tasks(TaskStatus::Dead).await?,
        queued_task_count: queued,
        skipped_event_count: store.skipped_count().await?,
        halted: cursor.and_then(|c| c.halted),
        last_alarm: store.last_alarm().await?,
    })
}
