//! ChainReactor CLI — simulate the pipeline and operate an indexer.
//!
//! # Commands
//! ```text
//! chainreactor info
//! chainreactor simulate --blocks 40 --reorg-at 20 --finality-depth 6
//! chainreactor run      --rpc <url> --rules <rules.json> [--config <pipeline.json>] [--db <path>]
//! chainreactor status   --db <path> --chain <name>
//! chainreactor resume   --db <path> --chain <name> [--resync <height> --rpc <url>]
//! chainreactor version
//! ```
//!
//! `--db` needs a build with the `sqlite` feature.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use chainreactor_core::config::PipelineConfig;
use chainreactor_core::health::health_report;
use chainreactor_core::reconciler::Reconciler;
use chainreactor_core::store::ReactorStore;
use chainreactor_runtime::{JsonRpcSource, RpcMethods};
use chainreactor_storage::MemoryStore;

mod cmd_run;
mod cmd_simulate;
mod logging;

#[derive(Parser)]
#[command(
    name = "chainreactor",
    about = "Reorg-safe chain indexing and exactly-once automation",
    long_about = "
ChainReactor CLI: index a chain into reorg-safe projections and run
automation rules against confirmed events.

ENVIRONMENT VARIABLES:
  RUST_LOG   tracing filter directives (default: info)
  LOG_JSON   emit JSON logs when set to 1 / true
",
    version
)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show defaults and available backends
    Info,

    /// Run the whole pipeline in memory against a scripted chain with a reorg
    Simulate {
        /// Blocks to produce on the final canonical chain
        #[arg(long, default_value_t = 40)]
        blocks: u64,
        /// Height at which the scripted chain forks (0 disables the reorg)
        #[arg(long, default_value_t = 20)]
        reorg_at: u64,
        #[arg(long, default_value_t = 6)]
        finality_depth: u64,
        /// Automation rules JSON file (default: built-in sample rules)
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Index a JSON-RPC chain and execute actions until Ctrl-C
    Run {
        /// JSON-RPC endpoint
        #[arg(long)]
        rpc: String,
        /// Automation rules JSON file
        #[arg(long)]
        rules: PathBuf,
        /// Pipeline configuration JSON file
        #[arg(long)]
        config: Option<PathBuf>,
        /// SQLite database path (in-memory store when omitted)
        #[arg(long)]
        db: Option<String>,
    },

    /// Print the health report of a persisted pipeline
    Status {
        #[arg(long)]
        db: String,
        #[arg(long, default_value = "solana")]
        chain: String,
    },

    /// Clear a halted reconciler, optionally re-anchoring it first
    Resume {
        #[arg(long)]
        db: String,
        #[arg(long, default_value = "solana")]
        chain: String,
        /// Re-anchor the cursor at the source's block at this height
        #[arg(long)]
        resync: Option<u64>,
        /// JSON-RPC endpoint used by --resync
        #[arg(long, default_value = "http://127.0.0.1:8899")]
        rpc: String,
    },

    /// Print version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(&logging::LogConfig::from_env(cli.verbose));

    match cli.command {
        Commands::Info => {
            cmd_info();
            Ok(())
        }
        Commands::Simulate {
            blocks,
            reorg_at,
            finality_depth,
            rules,
            json,
        } => {
            let opts = cmd_simulate::SimulateOptions {
                blocks,
                reorg_at,
                finality_depth,
                rules,
                json,
            };
            cmd_simulate::run(opts).await
        }
        Commands::Run { rpc, rules, config, db } => {
            let store = open_store(db.as_deref()).await?;
            cmd_run::run(store, &rpc, &rules, config.as_deref()).await
        }
        Commands::Status { db, chain } => cmd_status(&db, &chain).await,
        Commands::Resume {
            db,
            chain,
            resync,
            rpc,
        } => cmd_resume(&db, &chain, resync, &rpc).await,
        Commands::Version => {
            println!("chainreactor {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn cmd_info() {
    let config = PipelineConfig::default();
    println!("ChainReactor v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default chain: {}", config.chain);
    println!("  Default finality depth: {} blocks", config.finality_depth);
    println!("  Default lookback window: {} blocks", config.lookback_window);
    println!("  Default fetch batch: {} blocks/pass", config.fetch_batch_size);
    println!(
        "  Default retries: {} attempts, {}ms initial backoff",
        config.executor.retry.max_attempts, config.executor.retry.initial_backoff_ms
    );
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
    println!("  Action sinks: webhook, chain transaction (dry-run), notification (log)");
}

/// Open the store behind `--db`, or an in-memory store when no path is given.
async fn open_store(db: Option<&str>) -> Result<Arc<dyn ReactorStore>> {
    let store: Arc<dyn ReactorStore> = match db {
        #[cfg(feature = "sqlite")]
        Some(path) => Arc::new(
            chainreactor_storage::SqliteStorage::open(path)
                .await
                .with_context(|| format!("opening {path}"))?,
        ),
        #[cfg(not(feature = "sqlite"))]
        Some(_) => anyhow::bail!("--db requires a build with the `sqlite` feature"),
        None => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

async fn cmd_status(db: &str, chain: &str) -> Result<()> {
    let store = open_store(Some(db)).await?;
    let report = health_report(store.as_ref(), chain).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_healthy() {
        std::process::exit(2);
    }
    Ok(())
}

async fn cmd_resume(db: &str, chain: &str, resync: Option<u64>, rpc: &str) -> Result<()> {
    let store = open_store(Some(db)).await?;
    let config = PipelineConfig {
        chain: chain.to_string(),
        ..Default::default()
    };
    let source = Arc::new(JsonRpcSource::new(
        rpc,
        RpcMethods::default(),
        Duration::from_millis(config.source_timeout_ms),
    )?);
    let reconciler = Reconciler::new(store, source, &config);
    let cursor = match resync {
        Some(height) => reconciler
            .resync(height)
            .await
            .with_context(|| format!("resyncing {chain} at height {height}"))?,
        None => reconciler.resume().await?,
    };
    println!("{}", serde_json::to_string_pretty(&cursor)?);
    Ok(())
}
