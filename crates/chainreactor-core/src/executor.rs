//! Action executor — runs due tasks through their sink with bounded retries.
//!
//! Delivery is at-least-once: a worker that crashes after the sink succeeded
//! but before `complete_task` leaves the task to be reclaimed once its lease
//! expires. The lapsed claim counts as a failed attempt, and the first worker
//! can no longer report on it. Sinks deduplicate on the task's idempotency key.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::action::{
    ActionError, ActionReceipt, ActionSink, ActionTask, ClaimBatch, ClaimRequest, TaskFailure, TaskStatus, LEASE_EXPIRED,
};
use crate::config::ExecutorConfig;
use crate::error::ReactorError;
use crate::metrics::ReactorMetrics;
use crate::retry::RetryPolicy;
use crate::store::TaskStore;
use crate::types::now_ms;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorReport {
    pub claimed: u64,
    pub succeeded: u64,
    /// Failed and scheduled for retry.
    pub retrying: u64,
    /// Moved to the dead-letter state.
    pub dead: u64,
}

pub struct ActionExecutor<S: ?Sized, K: ?Sized> {
    store: Arc<S>,
    sink: Arc<K>,
    policy: RetryPolicy,
    action_timeout_ms: u64,
    lease_grace_ms: u64,
    batch_size: usize,
    metrics: ReactorMetrics,
}

impl<S, K> ActionExecutor<S, K>
where
    S: TaskStore + ?Sized,
    K: ActionSink + ?Sized,
{
    pub fn new(store: Arc<S>, sink: Arc<K>, config: &ExecutorConfig) -> Self {
        Self {
            store,
            sink,
            policy: RetryPolicy::new(config.retry.clone()),
            action_timeout_ms: config.action_timeout_ms,
            lease_grace_ms: config.lease_grace_ms,
            batch_size: config.batch_size.max(1),
            metrics: ReactorMetrics::global(),
        }
    }

    pub fn with_metrics(mut self, metrics: ReactorMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub async fn run_once(&self) -> Result<ExecutorReport, ReactorError> {
        self.run_once_at(now_ms()).await
    }

    /// Claim and execute the tasks due at `now`.
    pub async fn run_once_at(&self, now: i64) -> Result<ExecutorReport, ReactorError> {
        let request = ClaimRequest {
            now,
            limit: self.batch_size,
            lease_until: now + (self.action_timeout_ms + self.lease_grace_ms) as i64,
            max_attempts: self.policy.config.max_attempts,
        };
        let ClaimBatch { tasks, dead_lettered } = self.store.claim_due(request).await?;
        let mut report = ExecutorReport {
            claimed: tasks.len() as u64,
            dead: dead_lettered.len() as u64,
            ..Default::default()
        };
        for task in &dead_lettered {
            tracing::error!(
                task_id = task.task_id,
                rule = %task.rule_id,
                attempt = task.attempt,
                error = LEASE_EXPIRED,
                "action dead-lettered"
            );
            self.metrics.record_dead_lettered(&task.rule_id, task.action.label());
        }
        if tasks.is_empty() {
            return Ok(report);
        }

        let results = join_all(tasks.iter().map(|task| self.execute(task))).await;
        for (task, result) in tasks.iter().zip(results) {
            match result {
                Ok(receipt) => {
                    if self.store.complete_task(task.task_id, task.attempt, &receipt.reference, now_ms()).await? {
                        tracing::info!(
                            task_id = task.task_id,
                            rule = %task.rule_id,
                            key = %task.idempotency_key,
                            receipt = %receipt.reference,
                            "action succeeded"
                        );
                        self.metrics.record_succeeded(task.action.label());
                        report.succeeded += 1;
                    } else {
                        tracing::warn!(task_id = task.task_id, "task lease lost before completion");
                    }
                }
                Err(err) => {
                    let failure = self.failure(task, &err, now);
                    let dead = failure.status == TaskStatus::Dead;
                    if !self.store.fail_task(task.task_id, failure).await? {
                        tracing::warn!(task_id = task.task_id, "task lease lost before recording failure");
                        continue;
                    }
                    if dead {
                        tracing::error!(
                            task_id = task.task_id,
                            rule = %task.rule_id,
                            attempt = task.attempt + 1,
                            error = %err,
                            "action dead-lettered"
                        );
                        self.metrics.record_dead_lettered(&task.rule_id, task.action.label());
                        report.dead += 1;
                    } else {
                        tracing::warn!(
                            task_id = task.task_id,
                            rule = %task.rule_id,
                            attempt = task.attempt + 1,
                            error = %err,
                            "action failed, will retry"
                        );
                        report.retrying += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn execute(&self, task: &ActionTask) -> Result<ActionReceipt, ActionError> {
        let deadline = Duration::from_millis(self.action_timeout_ms);
        match tokio::time::timeout(deadline, self.sink.execute(task)).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Timeout { ms: self.action_timeout_ms }),
        }
    }

    fn failure(&self, task: &ActionTask, err: &ActionError, now: i64) -> TaskFailure {
        let attempt = task.attempt + 1;
        let retry = !err.is_permanent() && self.policy.should_retry(attempt);
        let next_retry_at = if retry {
            now + self.policy.next_delay(attempt, &task.idempotency_key).as_millis() as i64
        } else {
            now
        };
        TaskFailure {
            attempt,
            status: if retry { TaskStatus::Failed } else { TaskStatus::Dead },
            next_retry_at,
            error: err.to_string(),
            at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::action::{ActionSpec, NewTask};
    use crate::memory::MemoryStore;
    use crate::retry::RetryConfig;
    use crate::store::TriggerStore;
    use crate::trigger::{FiringStatus, NewFiring};

    /// Fails the first `failures` calls with `error`, then succeeds.
    struct ScriptedSink {
        failures: u32,
        error: ActionError,
        calls: AtomicU32,
        delay_ms: u64,
    }

    impl ScriptedSink {
        fn new(failures: u32, error: ActionError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
                delay_ms: 0,
            }
        }
    }

    #[async_trait]
    impl ActionSink for ScriptedSink {
        async fn execute(&self, task: &ActionTask) -> Result<ActionReceipt, ActionError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(self.error.clone());
            }
            Ok(ActionReceipt {
                reference: format!("ok:{}", task.idempotency_key),
            })
        }
    }

    fn config(max_attempts: u32) -> ExecutorConfig {
        ExecutorConfig {
            retry: RetryConfig {
                max_attempts,
                initial_backoff_ms: 100,
                max_backoff_ms: 1_000,
                multiplier: 2.0,
                jitter_fraction: 0.0,
            },
            action_timeout_ms: 50,
            lease_grace_ms: 50,
            batch_size: 8,
        }
    }

    async fn enqueue(store: &MemoryStore) {
        let firing = NewFiring {
            rule_id: "r1".into(),
            sequence_id: 1,
            fired_at: 0,
        };
        let task = NewTask {
            action: ActionSpec::Webhook {
                url: "https://hooks.test/sale".into(),
                headers: Default::default(),
            },
            payload: json!({"sequence_id": 1}),
            idempotency_key: "r1:1".into(),
            next_retry_at: 0,
        };
        store.fire(firing, task).await.unwrap();
    }

    #[tokio::test]
    async fn success_completes_task_and_firing() {
        let store = Arc::new(MemoryStore::new());
        enqueue(&store).await;
        let sink = Arc::new(ScriptedSink::new(0, ActionError::Transient("unused".into())));
        let executor = ActionExecutor::new(Arc::clone(&store), sink, &config(5));

        let report = executor.run_once_at(0).await.unwrap();
        assert_eq!(report.succeeded, 1);
        let task = store.task(1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.receipt.as_deref(), Some("ok:r1:1"));
        let firing = store.firing("r1", 1).await.unwrap().unwrap();
        assert_eq!(firing.status, FiringStatus::Completed);
    }

    #[tokio::test]
    async fn transient_failure_backs_off() {
        let store = Arc::new(MemoryStore::new());
        enqueue(&store).await;
        let sink = Arc::new(ScriptedSink::new(1, ActionError::Transient("503".into())));
        let executor = ActionExecutor::new(Arc::clone(&store), sink, &config(5));

        let report = executor.run_once_at(1_000).await.unwrap();
        assert_eq!(report.retrying, 1);
        let task = store.task(1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt, 1);
        assert_eq!(task.next_retry_at, 1_100);

        // Not due yet
        assert_eq!(executor.run_once_at(1_050).await.unwrap().claimed, 0);
        assert_eq!(executor.run_once_at(1_100).await.unwrap().succeeded, 1);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let store = Arc::new(MemoryStore::new());
        enqueue(&store).await;
        let sink = Arc::new(ScriptedSink::new(1, ActionError::Permanent("410 gone".into())));
        let executor = ActionExecutor::new(Arc::clone(&store), sink, &config(5));

        let report = executor.run_once_at(0).await.unwrap();
        assert_eq!(report.dead, 1);
        let task = store.task(1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Dead);
        assert_eq!(task.attempt, 1);
        let firing = store.firing("r1", 1).await.unwrap().unwrap();
        assert_eq!(firing.status, FiringStatus::Enqueued);
    }

    #[tokio::test]
    async fn timeout_counts_as_transient_failure() {
        let store = Arc::new(MemoryStore::new());
        enqueue(&store).await;
        let mut sink = ScriptedSink::new(0, ActionError::Transient("unused".into()));
        sink.delay_ms = 500;
        let executor = ActionExecutor::new(Arc::clone(&store), Arc::new(sink), &config(5));

        let report = executor.run_once_at(0).await.unwrap();
        assert_eq!(report.retrying, 1);
        let task = store.task(1).await.unwrap().unwrap();
        assert!(task.last_error.unwrap().contains("timed out"));
    }

    /// Claim the task the way a worker that then crashes would.
    async fn abandoned_claim(store: &MemoryStore, now: i64, lease_until: i64, max_attempts: u32) {
        let request = ClaimRequest {
            now,
            limit: 8,
            lease_until,
            max_attempts,
        };
        assert_eq!(store.claim_due(request).await.unwrap().tasks.len(), 1);
    }

    #[tokio::test]
    async fn expired_claim_is_reclaimed_and_fences_the_first_worker() {
        let store = Arc::new(MemoryStore::new());
        enqueue(&store).await;
        abandoned_claim(&store, 0, 100, 5).await;
        let sink = Arc::new(ScriptedSink::new(0, ActionError::Transient("unused".into())));
        let executor = ActionExecutor::new(Arc::clone(&store), Arc::clone(&sink), &config(5));

        // Lease still held by the crashed worker.
        assert_eq!(executor.run_once_at(99).await.unwrap().claimed, 0);

        let report = executor.run_once_at(100).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.succeeded, 1);
        let task = store.task(1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempt, 1);
        assert_eq!(task.last_error.as_deref(), Some(LEASE_EXPIRED));

        // The first worker wakes up and reports against its stale claim.
        assert!(!store.complete_task(1, 0, "late", 150).await.unwrap());
        assert_eq!(store.task(1).await.unwrap().unwrap().receipt.as_deref(), Some("ok:r1:1"));
    }

    #[tokio::test]
    async fn repeatedly_abandoned_task_is_dead_lettered() {
        let store = Arc::new(MemoryStore::new());
        enqueue(&store).await;
        abandoned_claim(&store, 0, 100, 2).await;
        abandoned_claim(&store, 100, 200, 2).await;
        let sink = Arc::new(ScriptedSink::new(0, ActionError::Transient("unused".into())));
        let executor = ActionExecutor::new(Arc::clone(&store), Arc::clone(&sink), &config(2));

        let report = executor.run_once_at(200).await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(report.dead, 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
        let task = store.task(1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Dead);
        assert_eq!(task.attempt, 2);
        let firing = store.firing("r1", 1).await.unwrap().unwrap();
        assert_eq!(firing.status, FiringStatus::Enqueued);
        assert_eq!(executor.run_once_at(10_000).await.unwrap(), ExecutorReport::default());
    }
}
