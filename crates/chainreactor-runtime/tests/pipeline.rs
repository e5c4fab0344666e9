//! End-to-end pipeline tests over a scripted chain and the in-memory store.
//!
//! Each test drives the pipeline in lock-step (`step_all` / `drain`) so the
//! interleaving of reconciler, projector, trigger engine, and executor is
//! deterministic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use chainreactor_core::action::{ActionError, ActionReceipt, ActionSink, ActionSpec, ActionTask, TaskStatus};
use chainreactor_core::alarm::AlarmKind;
use chainreactor_core::config::WorkerState;
use chainreactor_core::error::ReactorError;
use chainreactor_core::log::CanonicalLog;
use chainreactor_core::projection::{NftOwnership, ProjectionKind, RecordRef};
use chainreactor_core::retry::RetryConfig;
use chainreactor_core::store::{ConsumerStore, ProjectionStore, TaskStore, TriggerStore};
use chainreactor_core::trigger::{AutomationRule, FiringStatus, StaticRuleSource, TriggerEngine, TriggerPredicate};
use chainreactor_core::types::EventStatus;
use chainreactor_runtime::{Pipeline, PipelineBuilder, ScriptedChain};
use chainreactor_storage::MemoryStore;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn mint_rule() -> AutomationRule {
    AutomationRule {
        rule_id: "notify-mint".into(),
        trigger: TriggerPredicate::Kind {
            kind: "nft_minted".into(),
        },
        action: ActionSpec::Webhook {
            url: "https://hooks.example.com/mint".into(),
            headers: Default::default(),
        },
        enabled: true,
    }
}

/// Sink that counts executions and either always succeeds or always fails.
#[derive(Default)]
struct CountingSink {
    calls: AtomicU32,
    failing: bool,
}

impl CountingSink {
    fn failing() -> Self {
        Self {
            calls: AtomicU32::new(0),
            failing: true,
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionSink for CountingSink {
    async fn execute(&self, task: &ActionTask) -> Result<ActionReceipt, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(ActionError::Transient("endpoint down".into()));
        }
        Ok(ActionReceipt {
            reference: format!("ok:{}", task.idempotency_key),
        })
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_backoff_ms: 1,
        max_backoff_ms: 1,
        multiplier: 1.0,
        jitter_fraction: 0.0,
    }
}

fn pipeline(
    chain: &Arc<ScriptedChain>,
    store: &Arc<MemoryStore>,
    sink: Arc<CountingSink>,
) -> Pipeline<MemoryStore, ScriptedChain> {
    PipelineBuilder::new()
        .chain("testnet")
        .start_height(1)
        .finality_depth(3)
        .lookback_window(16)
        .poll_interval_ms(10)
        .retry(fast_retry())
        .rules(Arc::new(StaticRuleSource::new(vec![mint_rule()])))
        .sink(sink)
        .build(Arc::clone(store), Arc::clone(chain))
        .unwrap()
}

async fn owner_of(store: &MemoryStore, token_id: &str) -> Option<NftOwnership> {
    store
        .load_record(&RecordRef::new(ProjectionKind::NftOwnership, token_id))
        .await
        .unwrap()
        .map(|r| r.decode().unwrap())
}

// ─── Log ──────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn redelivered_blocks_append_nothing() {
    let chain = Arc::new(ScriptedChain::new());
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(&chain, &store, Arc::new(CountingSink::default()));

    chain.push_event("nft_minted", json!({"token_id": "t1", "owner": "alice"}));
    chain.extend(2);
    p.reconcile_step().await.unwrap();
    let before: Vec<u64> = store.events().unwrap().iter().map(|e| e.sequence_id).collect();
    assert_eq!(before, vec![1]);

    let again: Vec<_> = (1..=3).filter_map(|h| chain.block_at(h)).collect();
    let outcome = p.reconciler().observe(again).await.unwrap();
    assert_eq!(outcome.adopted, 0);
    assert_eq!(outcome.duplicates, 3);
    assert_eq!(outcome.appended, 0);

    let after: Vec<u64> = store.events().unwrap().iter().map(|e| e.sequence_id).collect();
    assert_eq!(after, before);
}

#[tokio::test]
async fn projections_apply_in_sequence_order() {
    let chain = Arc::new(ScriptedChain::new());
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(&chain, &store, Arc::new(CountingSink::default()));

    chain.push_event("nft_minted", json!({"token_id": "t1", "owner": "alice"}));
    chain.push_event("nft_transferred", json!({"token_id": "t1", "from": "alice", "to": "bob"}));
    chain.push_event("nft_transferred", json!({"token_id": "t1", "from": "bob", "to": "carol"}));
    chain.extend(3);

    p.drain(10).await.unwrap();

    let confirmed = store.confirmed_since(0, 100).await.unwrap();
    let seqs: Vec<u64> = confirmed.iter().map(|e| e.sequence_id).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    let record = store
        .load_record(&RecordRef::new(ProjectionKind::NftOwnership, "t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.last_applied_sequence_id, 3);
    let owner: NftOwnership = record.decode().unwrap();
    assert_eq!(owner.owner.as_deref(), Some("carol"));
    assert_eq!(owner.transfer_count, 2);
    assert_eq!(store.load_offset("projector").await.unwrap(), 3);
}

// ─── Finality ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn events_confirm_exactly_at_finality_depth() {
    let chain = Arc::new(ScriptedChain::new());
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(&chain, &store, Arc::new(CountingSink::default()));

    chain.push_event("nft_minted", json!({"token_id": "t1", "owner": "alice"}));
    chain.extend(2);
    p.step_all().await.unwrap();
    // Two blocks on top, depth is 3.
    assert_eq!(store.event(1).await.unwrap().unwrap().status, EventStatus::Provisional);
    assert!(owner_of(&store, "t1").await.is_none());

    chain.extend(1);
    let report = p.step_all().await.unwrap();
    assert_eq!(report.reconcile.confirmed, 1);
    assert_eq!(store.event(1).await.unwrap().unwrap().status, EventStatus::Confirmed);
    assert_eq!(report.projector.applied, 1);
    assert_eq!(owner_of(&store, "t1").await.unwrap().owner.as_deref(), Some("alice"));
}

// ─── Reorgs ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reorged_event_never_reaches_projections_or_triggers() {
    let chain = Arc::new(ScriptedChain::new());
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CountingSink::default());
    let p = pipeline(&chain, &store, Arc::clone(&sink));

    chain.extend(9);
    chain.push_event("nft_minted", json!({"token_id": "t1", "owner": "alice"}));
    chain.extend(1);
    p.drain(10).await.unwrap();
    let alice = store.events().unwrap().into_iter().find(|e| e.block_hash == "main-10").unwrap();
    assert_eq!(alice.status, EventStatus::Provisional);

    chain.fork_at(10);
    chain.push_event("nft_minted", json!({"token_id": "t1", "owner": "bob"}));
    chain.extend(2);

    let report = p.step_all().await.unwrap();
    let reorg = report.reconcile.reorg.expect("reorg detected");
    assert_eq!(reorg.common_ancestor, 9);
    assert_eq!(reorg.depth, 2);
    assert_eq!(report.reconcile.orphaned, 1);
    assert_eq!(store.event(alice.sequence_id).await.unwrap().unwrap().status, EventStatus::Orphaned);
    assert!(owner_of(&store, "t1").await.is_none());

    chain.extend(3);
    p.drain(10).await.unwrap();

    let bob = store.events().unwrap().into_iter().find(|e| e.block_hash == "fork1-10").unwrap();
    assert_eq!(bob.status, EventStatus::Confirmed);
    assert!(bob.sequence_id > alice.sequence_id);
    let owner = owner_of(&store, "t1").await.unwrap();
    assert_eq!(owner.owner.as_deref(), Some("bob"));
    assert_eq!(owner.transfer_count, 0);

    let firings = store.firings().await.unwrap();
    assert_eq!(firings.len(), 1);
    assert_eq!(firings[0].chain_event_sequence_id, bob.sequence_id);
    assert_eq!(sink.calls(), 1);
}

#[tokio::test]
async fn reorg_beyond_lookback_halts_with_alarm() {
    let chain = Arc::new(ScriptedChain::new());
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(&chain, &store, Arc::new(CountingSink::default()));

    chain.extend(30);
    p.drain(10).await.unwrap();

    chain.fork_at(5);
    chain.extend(30);
    let err = p.reconcile_step().await.unwrap_err();
    assert!(matches!(err, ReactorError::ReorgDepthExceeded { .. }));
    assert!(err.is_fatal());

    let err = p.reconcile_step().await.unwrap_err();
    assert!(matches!(err, ReactorError::Halted { .. }));

    let health = p.health().await.unwrap();
    assert!(health.halted.is_some());
    assert!(!health.is_healthy());
    assert_eq!(health.cursor_height, 30);
    assert_eq!(health.last_alarm.unwrap().kind, AlarmKind::ReorgDepthExceeded);
}

// ─── Triggers & actions ───────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_engines_fire_once() {
    let chain = Arc::new(ScriptedChain::new());
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(&chain, &store, Arc::new(CountingSink::default()));

    chain.push_event("nft_minted", json!({"token_id": "t1", "owner": "alice"}));
    chain.extend(3);
    p.reconcile_step().await.unwrap();

    let rules = Arc::new(StaticRuleSource::new(vec![mint_rule()]));
    let a = TriggerEngine::new(Arc::clone(&store), Arc::clone(&rules), 16).with_consumer("engine-a");
    let b = TriggerEngine::new(Arc::clone(&store), Arc::clone(&rules), 16).with_consumer("engine-b");
    let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.fired + rb.fired, 1);
    assert_eq!(ra.already_fired + rb.already_fired, 1);
    assert_eq!(store.firings().await.unwrap().len(), 1);
    assert_eq!(store.tasks().unwrap().len(), 1);

    // A replay from the start of the log is a no-op.
    let replay = TriggerEngine::new(Arc::clone(&store), rules, 16).with_consumer("engine-c");
    let report = replay.run_once().await.unwrap();
    assert_eq!(report.fired, 0);
    assert_eq!(report.already_fired, 1);
    assert_eq!(store.tasks().unwrap().len(), 1);
}

#[tokio::test]
async fn failing_action_is_dead_lettered_after_max_attempts() {
    let chain = Arc::new(ScriptedChain::new());
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CountingSink::failing());
    let p = pipeline(&chain, &store, Arc::clone(&sink));

    chain.push_event("nft_minted", json!({"token_id": "t1", "owner": "alice"}));
    chain.extend(3);

    for _ in 0..200 {
        p.step_all().await.unwrap();
        if store.count_tasks(TaskStatus::Dead).await.unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let tasks = store.tasks().unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.status, TaskStatus::Dead);
    assert_eq!(task.attempt, 5);
    assert!(task.last_error.as_deref().unwrap().contains("endpoint down"));
    assert_eq!(sink.calls(), 5);

    let firing = store.firing("notify-mint", 1).await.unwrap().unwrap();
    assert_eq!(firing.status, FiringStatus::Enqueued);

    // Dead tasks are never claimed again.
    p.step_all().await.unwrap();
    assert_eq!(sink.calls(), 5);
    let health = p.health().await.unwrap();
    assert_eq!(health.dead_task_count, 1);
    assert!(!health.is_healthy());
}

#[tokio::test]
async fn successful_action_completes_firing() {
    let chain = Arc::new(ScriptedChain::new());
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CountingSink::default());
    let p = pipeline(&chain, &store, Arc::clone(&sink));

    chain.push_event("nft_minted", json!({"token_id": "t1", "owner": "alice"}));
    chain.extend(3);
    p.drain(10).await.unwrap();

    let task = store.task(1).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.receipt.as_deref(), Some("ok:notify-mint:1"));
    let firing = store.firing("notify-mint", 1).await.unwrap().unwrap();
    assert_eq!(firing.status, FiringStatus::Completed);
    assert!(p.health().await.unwrap().is_healthy());
}

// ─── Workers ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn spawned_workers_process_and_shut_down() {
    let chain = Arc::new(ScriptedChain::new());
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CountingSink::default());
    let p = Arc::new(pipeline(&chain, &store, Arc::clone(&sink)));

    chain.push_event("nft_minted", json!({"token_id": "t1", "owner": "alice"}));
    chain.extend(3);
    let handle = Arc::clone(&p).spawn();

    for _ in 0..200 {
        if sink.calls() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sink.calls(), 1);
    assert!(handle.states().iter().all(|(_, s)| *s == WorkerState::Running));

    handle.shutdown().await.unwrap();
    assert_eq!(owner_of(&store, "t1").await.unwrap().owner.as_deref(), Some("alice"));
}
