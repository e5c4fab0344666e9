//! `chainreactor simulate` — the whole pipeline in memory, against a scripted
//! chain that reorganizes part-way through.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use chainreactor_core::action::{ActionError, ActionReceipt, ActionSink, ActionSpec, ActionTask, TaskStatus};
use chainreactor_core::health::HealthReport;
use chainreactor_core::projection::ProjectionKind;
use chainreactor_core::store::{ProjectionStore, TriggerStore};
use chainreactor_core::trigger::StaticRuleSource;
use chainreactor_core::types::EventStatus;
use chainreactor_runtime::{
    ActionRouter, ChainTxSink, DryRunSubmitter, LoggingNotifier, NotificationSink, PipelineBuilder, ScriptedChain,
};
use chainreactor_storage::MemoryStore;

const SAMPLE_RULES: &str = r#"[
  {
    "rule_id": "sale-webhook",
    "trigger": {"type": "kind", "kind": "listing_filled"},
    "action": {"type": "webhook", "url": "https://hooks.example.com/sales"}
  },
  {
    "rule_id": "mint-notify",
    "trigger": {"type": "kind", "kind": "nft_minted"},
    "action": {
      "type": "notification",
      "channel": "email",
      "recipient": "{{payload.owner}}",
      "template": "Token {{payload.token_id}} minted at block {{block_height}}"
    }
  },
  {
    "rule_id": "whale-vote",
    "trigger": {"type": "all", "predicates": [
      {"type": "kind", "kind": "vote_cast"},
      {"type": "field_at_least", "path": "weight", "min": 10}
    ]},
    "action": {"type": "chain_transaction", "target": "Gov1111", "method": "record_whale_vote"}
  }
]"#;

pub struct SimulateOptions {
    pub blocks: u64,
    pub reorg_at: u64,
    pub finality_depth: u64,
    pub rules: Option<PathBuf>,
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct Summary {
    events: usize,
    confirmed: usize,
    provisional: usize,
    orphaned: usize,
    projections: Vec<(String, usize)>,
    firings: usize,
    tasks_succeeded: usize,
    tasks_dead: usize,
    health: HealthReport,
}

/// Logs webhook deliveries instead of sending them.
struct DryRunWebhook;

#[async_trait]
impl ActionSink for DryRunWebhook {
    async fn execute(&self, task: &ActionTask) -> Result<ActionReceipt, ActionError> {
        let ActionSpec::Webhook { url, .. } = &task.action else {
            return Err(ActionError::Permanent("not a webhook action".into()));
        };
        tracing::info!(url = %url, key = %task.idempotency_key, payload = %task.payload, "dry-run webhook");
        Ok(ActionReceipt {
            reference: format!("dry-run:{}", task.idempotency_key),
        })
    }
}

/// The event emitted in block `height`; `tag` separates fork branches.
fn scripted_event(height: u64, tag: &str) -> Option<(&'static str, Value)> {
    let wallet = |n: u64| format!("{tag}wallet-{}", n % 3);
    match height % 5 {
        1 => Some((
            "nft_minted",
            json!({"token_id": format!("t{height}"), "owner": wallet(height)}),
        )),
        2 => Some((
            "listing_created",
            json!({
                "listing_id": format!("l{height}"),
                "token_id": format!("t{}", height - 1),
                "seller": wallet(height - 1),
                "price": (height * 1_000).to_string(),
            }),
        )),
        3 => Some((
            "listing_filled",
            json!({"listing_id": format!("l{}", height - 1), "buyer": wallet(height + 1)}),
        )),
        4 => Some((
            "vote_cast",
            json!({
                "proposal_id": "p1",
                "voter": wallet(height),
                "choice": if height % 2 == 0 { "for" } else { "against" },
                "weight": height,
            }),
        )),
        _ => None,
    }
}

fn produce(chain: &ScriptedChain, to_height: u64, tag: &str) {
    let mut height = chain.tip().map_or(1, |b| b.height + 1);
    while height <= to_height {
        match scripted_event(height, tag) {
            Some((kind, payload)) => chain.push_event(kind, payload),
            None => chain.push_block(vec![]),
        };
        height += 1;
    }
}

pub async fn run(opts: SimulateOptions) -> Result<()> {
    let rules = match &opts.rules {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            StaticRuleSource::from_json(&raw)?
        }
        None => StaticRuleSource::from_json(SAMPLE_RULES)?,
    };
    let router = ActionRouter::new()
        .with_webhook(Arc::new(DryRunWebhook))
        .with_chain_tx(Arc::new(ChainTxSink::new(Arc::new(DryRunSubmitter))))
        .with_notification(Arc::new(NotificationSink::new(Arc::new(LoggingNotifier))));

    let chain = Arc::new(ScriptedChain::new());
    let store = Arc::new(MemoryStore::new());
    let pipeline = PipelineBuilder::new()
        .chain("simulated")
        .start_height(1)
        .finality_depth(opts.finality_depth)
        .lookback_window(opts.finality_depth.saturating_mul(4).max(16))
        .fetch_batch_size(8)
        .rules(Arc::new(rules))
        .sink(Arc::new(router))
        .build(Arc::clone(&store), Arc::clone(&chain))?;

    let fork = opts.reorg_at > 1 && opts.reorg_at < opts.blocks;
    if fork {
        // Run far enough past the fork point that its events are indexed but
        // not yet final, then reorganize.
        let before = opts.reorg_at + opts.finality_depth.saturating_sub(1).max(1);
        produce(&chain, before, "");
        pipeline.drain(1_000).await?;
        let branch = chain.fork_at(opts.reorg_at);
        tracing::info!(height = opts.reorg_at, %branch, "scripted reorg");
        produce(&chain, opts.blocks.max(before + 1), "fork-");
    } else {
        produce(&chain, opts.blocks, "");
    }
    // Bury the tip so every block ends up final.
    chain.extend(opts.finality_depth);
    let rounds = pipeline.drain(1_000).await?;
    tracing::debug!(rounds, "pipeline drained");

    let events = store.events()?;
    let count = |status: EventStatus| events.iter().filter(|e| e.status == status).count();
    let mut projections = Vec::new();
    for kind in [
        ProjectionKind::NftOwnership,
        ProjectionKind::Listing,
        ProjectionKind::Vote,
        ProjectionKind::ProposalTally,
    ] {
        projections.push((kind.to_string(), store.records(kind).await?.len()));
    }
    let tasks = store.tasks()?;
    let summary = Summary {
        events: events.len(),
        confirmed: count(EventStatus::Confirmed),
        provisional: count(EventStatus::Provisional),
        orphaned: count(EventStatus::Orphaned),
        projections,
        firings: store.firings().await?.len(),
        tasks_succeeded: tasks.iter().filter(|t| t.status == TaskStatus::Succeeded).count(),
        tasks_dead: tasks.iter().filter(|t| t.status == TaskStatus::Dead).count(),
        health: pipeline.health().await?,
    };

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("Simulated {} blocks (reorg at {}):", chain.tip().map_or(0, |b| b.height), if fork { opts.reorg_at.to_string() } else { "none".into() });
    println!(
        "  events: {} ({} confirmed, {} provisional, {} orphaned)",
        summary.events, summary.confirmed, summary.provisional, summary.orphaned
    );
    for (kind, n) in &summary.projections {
        println!("  projection {kind}: {n} records");
    }
    println!(
        "  firings: {}, tasks succeeded: {}, dead: {}",
        summary.firings, summary.tasks_succeeded, summary.tasks_dead
    );
    println!(
        "  cursor: height {}, confirmed {}, healthy: {}",
        summary.health.cursor_height,
        summary.health.confirmed_height,
        summary.health.is_healthy()
    );
    Ok(())
}
