//! chainreactor-core — reorg-safe chain indexing and exactly-once automation.
//!
//! # Architecture
//!
//! ```text
//! ChainSource ──► Reconciler ──► CanonicalLog (provisional → confirmed / orphaned)
//!                    │                 │
//!                    │                 ├──► Projector      (NFT ownership, listings, votes)
//!                    │                 └──► TriggerEngine  (rule → TriggerFiring + ActionTask)
//!                    │                                          │
//!                    └── Cursor, BlockTracker                   └──► ActionExecutor ──► ActionSink
//!
//! Every component coordinates only through the store traits (memory / SQLite).
//! ```

pub mod action;
pub mod alarm;
pub mod config;
pub mod cursor;
pub mod error;
pub mod executor;
pub mod health;
pub mod log;
pub mod memory;
pub mod metrics;
pub mod projection;
pub mod projector;
pub mod reconciler;
pub mod retry;
pub mod source;
pub mod store;
pub mod tracker;
pub mod trigger;
pub mod types;

pub use action::{ActionError, ActionReceipt, ActionSink, ActionSpec, ActionTask, TaskStatus};
pub use alarm::{Alarm, AlarmKind};
pub use config::{ExecutorConfig, PipelineConfig, WorkerState};
pub use cursor::Cursor;
pub use error::ReactorError;
pub use executor::{ActionExecutor, ExecutorReport};
pub use health::{health_report, HealthReport};
pub use log::{stream_confirmed_since, CanonicalLog};
pub use memory::MemoryStore;
pub use metrics::ReactorMetrics;
pub use projection::{DomainEvent, ProjectionKind, ProjectionRecord};
pub use projector::{ApplyOutcome, Projector, ProjectorReport};
pub use reconciler::{ReconcileOutcome, Reconciler, ReorgEvent, ReorgType};
pub use retry::{RetryConfig, RetryPolicy};
pub use source::ChainSource;
pub use store::{
    AlarmStore, ConsumerStore, LedgerStore, ProjectionStore, ReactorStore, TaskStore, TriggerStore,
};
pub use tracker::BlockTracker;
pub use trigger::{AutomationRule, RuleSource, StaticRuleSource, TriggerEngine, TriggerPredicate};
pub use types::{ChainEvent, EventKey, EventStatus, RemoteBlock, RemoteLog, RemoteTransaction};
