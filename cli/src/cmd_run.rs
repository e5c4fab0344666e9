//! `chainreactor run` — long-running pipeline over a JSON-RPC source.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use chainreactor_core::config::PipelineConfig;
use chainreactor_core::store::ReactorStore;
use chainreactor_core::trigger::StaticRuleSource;
use chainreactor_runtime::{
    ActionRouter, ChainTxSink, DryRunSubmitter, JsonRpcSource, LoggingNotifier, NotificationSink, PipelineBuilder,
    RpcMethods, WebhookSink,
};

/// How often the health report is logged while running.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(store: Arc<dyn ReactorStore>, rpc: &str, rules: &Path, config: Option<&Path>) -> Result<()> {
    let config = match config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    let raw = std::fs::read_to_string(rules).with_context(|| format!("reading {}", rules.display()))?;
    let rules = StaticRuleSource::from_json(&raw).with_context(|| format!("parsing {}", rules.display()))?;

    let source = JsonRpcSource::new(
        rpc,
        RpcMethods::default(),
        Duration::from_millis(config.source_timeout_ms),
    )?;
    let webhook = WebhookSink::new(Duration::from_millis(config.executor.action_timeout_ms))?;
    let router = ActionRouter::new()
        .with_webhook(Arc::new(webhook))
        .with_chain_tx(Arc::new(ChainTxSink::new(Arc::new(DryRunSubmitter))))
        .with_notification(Arc::new(NotificationSink::new(Arc::new(LoggingNotifier))));

    let pipeline = Arc::new(
        PipelineBuilder::from_config(config)
            .rules(Arc::new(rules))
            .sink(Arc::new(router))
            .build(store, Arc::new(source))?,
    );
    tracing::info!(chain = %pipeline.config().chain, rpc, "pipeline running, Ctrl-C to stop");
    let handle = Arc::clone(&pipeline).spawn();

    let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match pipeline.health().await {
                    Ok(h) => tracing::info!(
                        cursor = h.cursor_height,
                        confirmed = h.confirmed_height,
                        lag = h.lag_behind_tip,
                        queued = h.queued_task_count,
                        dead = h.dead_task_count,
                        halted = ?h.halted,
                        "health"
                    ),
                    Err(e) => tracing::warn!(error = %e, "health report failed"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for Ctrl-C")?;
                break;
            }
        }
    }

    tracing::info!("shutting down");
    handle.shutdown().await?;
    let report = pipeline.health().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
