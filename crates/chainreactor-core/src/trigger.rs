//! Trigger engine — evaluates automation rules against confirmed events and
//! enqueues one action per `(rule, event)` pair.
//!
//! Exactly-once firing is a storage property: [`TriggerStore::fire`] inserts
//! the firing and its task in one commit, unique on `(rule_id, sequence_id)`.
//! Evaluating the same event twice, or from two engines at once, is harmless.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::action::{ActionSpec, NewTask};
use crate::error::ReactorError;
use crate::log::CanonicalLog;
use crate::metrics::ReactorMetrics;
use crate::store::{ConsumerStore, SkippedEvent, TriggerStore};
use crate::types::{now_ms, ChainEvent};

/// Consumer name used for the trigger engine's watermark.
pub const TRIGGER_CONSUMER: &str = "trigger-engine";

// ─── Rules ────────────────────────────────────────────────────────────────────

/// A pure predicate over a chain event.
///
/// Field paths are dot-separated keys into the event payload
/// (`"price"`, `"meta.collection"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerPredicate {
    AnyEvent,
    Kind { kind: String },
    KindIn { kinds: Vec<String> },
    FieldEquals { path: String, value: Value },
    /// Numeric comparison; numeric strings are accepted.
    FieldAtLeast { path: String, min: f64 },
    All { predicates: Vec<TriggerPredicate> },
    Any { predicates: Vec<TriggerPredicate> },
    Not { predicate: Box<TriggerPredicate> },
}

impl TriggerPredicate {
    pub fn matches(&self, event: &ChainEvent) -> bool {
        match self {
            Self::AnyEvent => true,
            Self::Kind { kind } => event.kind == *kind,
            Self::KindIn { kinds } => kinds.iter().any(|k| *k == event.kind),
            Self::FieldEquals { path, value } => field(&event.payload, path) == Some(value),
            Self::FieldAtLeast { path, min } => field(&event.payload, path)
                .and_then(as_number)
                .is_some_and(|n| n >= *min),
            Self::All { predicates } => predicates.iter().all(|p| p.matches(event)),
            Self::Any { predicates } => predicates.iter().any(|p| p.matches(event)),
            Self::Not { predicate } => !predicate.matches(event),
        }
    }
}

fn field<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(payload, |v, segment| v.get(segment))
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// A user-configured automation, owned by the external automation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub rule_id: String,
    pub trigger: TriggerPredicate,
    pub action: ActionSpec,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Read-only feed of automation rules.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn enabled_rules(&self) -> Result<Vec<AutomationRule>, ReactorError>;
}

/// A fixed rule set (config files, tests).
#[derive(Debug, Clone, Default)]
pub struct StaticRuleSource {
    rules: Vec<AutomationRule>,
}

impl StaticRuleSource {
    pub fn new(rules: Vec<AutomationRule>) -> Self {
        Self { rules }
    }

    /// Parse a JSON array of rules.
    pub fn from_json(json: &str) -> Result<Self, ReactorError> {
        Ok(Self::new(serde_json::from_str(json)?))
    }
}

#[async_trait]
impl RuleSource for StaticRuleSource {
    async fn enabled_rules(&self) -> Result<Vec<AutomationRule>, ReactorError> {
        Ok(self.rules.iter().filter(|r| r.enabled).cloned().collect())
    }
}

// ─── Firings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiringStatus {
    /// Task enqueued (including tasks that later went dead).
    Enqueued,
    /// The task succeeded.
    Completed,
}

impl FiringStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Completed => "completed",
        }
    }
}

impl std::str::FromStr for FiringStatus {
    type Err = ReactorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(Self::Enqueued),
            "completed" => Ok(Self::Completed),
            other => Err(ReactorError::Decode(format!("unknown firing status '{other}'"))),
        }
    }
}

/// The de-duplication record for one `(rule, event)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerFiring {
    pub firing_id: u64,
    pub rule_id: String,
    pub chain_event_sequence_id: u64,
    pub fired_at: i64,
    pub status: FiringStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFiring {
    pub rule_id: String,
    pub sequence_id: u64,
    pub fired_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Fired { firing_id: u64, task_id: u64 },
    AlreadyFired { firing_id: u64 },
}

/// Delivery identity shared by every retry of a firing's action.
pub fn idempotency_key(rule_id: &str, sequence_id: u64) -> String {
    format!("{rule_id}:{sequence_id}")
}

// ─── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    pub evaluated: u64,
    pub fired: u64,
    pub already_fired: u64,
    pub skipped: u64,
}

/// Evaluates enabled rules against confirmed events.
pub struct TriggerEngine<S: ?Sized, R: ?Sized> {
    store: Arc<S>,
    rules: Arc<R>,
    consumer: String,
    batch_size: usize,
    metrics: ReactorMetrics,
}

impl<S, R> TriggerEngine<S, R>
where
    S: CanonicalLog + TriggerStore + ConsumerStore + ?Sized,
    R: RuleSource + ?Sized,
{
    pub fn new(store: Arc<S>, rules: Arc<R>, batch_size: usize) -> Self {
        Self {
            store,
            rules,
            consumer: TRIGGER_CONSUMER.to_string(),
            batch_size: batch_size.max(1),
            metrics: ReactorMetrics::global(),
        }
    }

    pub fn with_metrics(mut self, metrics: ReactorMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Use a different watermark name (e.g. one per engine deployment).
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Fire every matching rule for one confirmed event.
    pub async fn evaluate(
        &self,
        event: &ChainEvent,
        rules: &[AutomationRule],
    ) -> Result<TriggerReport, ReactorError> {
        let mut report = TriggerReport::default();
        if !event.is_confirmed() {
            return Ok(report);
        }
        if let Err(reason) = event.validate() {
            tracing::warn!(seq = event.sequence_id, %reason, "skipping malformed event");
            self.store
                .record_skipped(SkippedEvent {
                    consumer: self.consumer.clone(),
                    sequence_id: event.sequence_id,
                    reason,
                    recorded_at: now_ms(),
                })
                .await?;
            self.metrics.record_skipped(&self.consumer);
            report.skipped += 1;
            return Ok(report);
        }
        report.evaluated += 1;

        for rule in rules.iter().filter(|r| r.enabled && r.trigger.matches(event)) {
            let fired_at = now_ms();
            let firing = NewFiring {
                rule_id: rule.rule_id.clone(),
                sequence_id: event.sequence_id,
                fired_at,
            };
            let task = NewTask {
                action: rule.action.clone(),
                payload: firing_payload(rule, event),
                idempotency_key: idempotency_key(&rule.rule_id, event.sequence_id),
                next_retry_at: fired_at,
            };
            match self.store.fire(firing, task).await? {
                FireOutcome::Fired { firing_id, task_id } => {
                    tracing::info!(
                        rule = %rule.rule_id,
                        seq = event.sequence_id,
                        firing_id,
                        task_id,
                        action = rule.action.label(),
                        "rule fired"
                    );
                    report.fired += 1;
                }
                FireOutcome::AlreadyFired { firing_id } => {
                    tracing::debug!(rule = %rule.rule_id, seq = event.sequence_id, firing_id, "already fired");
                    report.already_fired += 1;
                }
            }
        }
        Ok(report)
    }

    /// Process the next batch of confirmed events after this engine's watermark.
    pub async fn run_once(&self) -> Result<TriggerReport, ReactorError> {
        let offset = self.store.load_offset(&self.consumer).await?;
        let events = self.store.confirmed_since(offset, self.batch_size).await?;
        let mut report = TriggerReport::default();
        let Some(last) = events.last().map(|e| e.sequence_id) else {
            return Ok(report);
        };
        let rules = self.rules.enabled_rules().await?;

        for event in &events {
            let r = self.evaluate(event, &rules).await?;
            report.evaluated += r.evaluated;
            report.fired += r.fired;
            report.already_fired += r.already_fired;
            report.skipped += r.skipped;
        }
        self.store.save_offset(&self.consumer, last).await?;
        tracing::debug!(consumer = %self.consumer, offset = last, fired = report.fired, "trigger batch done");
        Ok(report)
    }
}

/// The event snapshot handed to action sinks.
fn firing_payload(rule: &AutomationRule, event: &ChainEvent) -> Value {
    json!({
        "rule_id": rule.rule_id,
        "sequence_id": event.sequence_id,
        "kind": event.kind,
        "block_height": event.block_height,
        "block_hash": event.block_hash,
        "tx_signature": event.tx_signature,
        "logical_index": event.logical_index,
        "payload": event.payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use crate::memory::MemoryStore;
    use crate::store::{LedgerCommit, LedgerStore};
    use crate::types::{EventDraft, EventStatus};

    fn event(kind: &str, payload: Value) -> ChainEvent {
        let mut ev = ChainEvent::from_draft(
            EventDraft {
                block_height: 10,
                block_hash: "0x10".into(),
                tx_signature: "sig".into(),
                logical_index: 0,
                kind: kind.into(),
                payload,
                observed_at: 0,
            },
            1,
        );
        ev.status = EventStatus::Confirmed;
        ev
    }

    #[test]
    fn kind_and_field_predicates() {
        let sale = event("listing_filled", json!({"listing_id": "L1", "price": "1500", "meta": {"collection": "apes"}}));
        assert!(TriggerPredicate::Kind { kind: "listing_filled".into() }.matches(&sale));
        assert!(!TriggerPredicate::Kind { kind: "nft_minted".into() }.matches(&sale));
        assert!(TriggerPredicate::FieldEquals {
            path: "meta.collection".into(),
            value: json!("apes")
        }
        .matches(&sale));
        assert!(TriggerPredicate::FieldAtLeast { path: "price".into(), min: 1000.0 }.matches(&sale));
        assert!(!TriggerPredicate::FieldAtLeast { path: "price".into(), min: 2000.0 }.matches(&sale));
        assert!(!TriggerPredicate::FieldAtLeast { path: "missing".into(), min: 0.0 }.matches(&sale));
    }

    #[test]
    fn combinators() {
        let mint = event("nft_minted", json!({"token_id": "1"}));
        let p = TriggerPredicate::All {
            predicates: vec![
                TriggerPredicate::KindIn { kinds: vec!["nft_minted".into(), "nft_burned".into()] },
                TriggerPredicate::Not {
                    predicate: Box::new(TriggerPredicate::FieldEquals {
                        path: "token_id".into(),
                        value: json!("2"),
                    }),
                },
            ],
        };
        assert!(p.matches(&mint));
        let none = TriggerPredicate::Any { predicates: vec![] };
        assert!(!none.matches(&mint));
    }

    #[test]
    fn rule_parses_from_json() {
        let rules = StaticRuleSource::from_json(
            r#"[{
                "rule_id": "notify-sale",
                "trigger": {"type": "kind", "kind": "listing_filled"},
                "action": {"type": "notification", "channel": "email", "recipient": "seller", "template": "sold"}
            }]"#,
        )
        .unwrap();
        assert_eq!(rules.rules.len(), 1);
        assert!(rules.rules[0].enabled);
    }

    #[test]
    fn idempotency_key_is_stable() {
        assert_eq!(idempotency_key("r1", 42), "r1:42");
    }

    fn notify_rule(rule_id: &str, kind: &str) -> AutomationRule {
        AutomationRule {
            rule_id: rule_id.into(),
            trigger: TriggerPredicate::Kind { kind: kind.into() },
            action: ActionSpec::Notification {
                channel: "email".into(),
                recipient: "seller".into(),
                template: "sold".into(),
            },
            enabled: true,
        }
    }

    async fn seed_confirmed(store: &MemoryStore, kinds: &[&str]) {
        let mut cursor = Cursor::new("test");
        cursor.advance_tip(1, "0x1");
        let mut commit = LedgerCommit::cursor_only(0, cursor);
        commit.events = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| EventDraft {
                block_height: 1,
                block_hash: "0x1".into(),
                tx_signature: "sig".into(),
                logical_index: i as u32,
                kind: kind.to_string(),
                payload: json!({"listing_id": "L1"}),
                observed_at: 0,
            })
            .collect();
        commit.confirm_up_to = Some(1);
        store.commit(commit).await.unwrap();
    }

    #[tokio::test]
    async fn fires_once_per_rule_and_event() {
        let store = Arc::new(MemoryStore::new());
        seed_confirmed(&store, &["listing_filled", "nft_minted"]).await;
        let rules = Arc::new(StaticRuleSource::new(vec![
            notify_rule("notify-sale", "listing_filled"),
            notify_rule("notify-mint", "nft_minted"),
        ]));
        let engine = TriggerEngine::new(Arc::clone(&store), rules, 16);

        let report = engine.run_once().await.unwrap();
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.fired, 2);

        let event = store.event(1).await.unwrap().unwrap();
        let rules = vec![notify_rule("notify-sale", "listing_filled")];
        let again = engine.evaluate(&event, &rules).await.unwrap();
        assert_eq!(again.already_fired, 1);
        assert_eq!(again.fired, 0);

        let tasks = store.tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].idempotency_key, "notify-sale:1");
        assert_eq!(tasks[0].payload["kind"], "listing_filled");
        assert_eq!(tasks[0].status, crate::action::TaskStatus::Queued);
    }

    #[tokio::test]
    async fn two_engines_fire_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        seed_confirmed(&store, &["listing_filled"]).await;
        let rules = Arc::new(StaticRuleSource::new(vec![notify_rule("notify-sale", "listing_filled")]));
        let a = TriggerEngine::new(Arc::clone(&store), Arc::clone(&rules), 16).with_consumer("engine-a");
        let b = TriggerEngine::new(Arc::clone(&store), Arc::clone(&rules), 16).with_consumer("engine-b");

        let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.fired + rb.fired, 1);
        assert_eq!(ra.already_fired + rb.already_fired, 1);
        assert_eq!(store.firings().await.unwrap().len(), 1);
        assert_eq!(store.tasks().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_rules_and_malformed_events_do_not_fire() {
        let store = Arc::new(MemoryStore::new());
        seed_confirmed(&store, &["listing filled!", "listing_filled"]).await;
        let mut disabled = notify_rule("off", "listing_filled");
        disabled.enabled = false;
        let rules = Arc::new(StaticRuleSource::new(vec![disabled, notify_rule("any", "listing_filled")]));
        let engine = TriggerEngine::new(Arc::clone(&store), rules, 16);

        let report = engine.run_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.fired, 1);
        assert!(store.firing("off", 2).await.unwrap().is_none());
        assert!(store.firing("any", 2).await.unwrap().is_some());
        assert_eq!(store.load_offset(TRIGGER_CONSUMER).await.unwrap(), 2);
    }
}
