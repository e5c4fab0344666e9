//! chainreactor-runtime — chain sources, action sinks, and the worker runtime.
//!
//! - [`fetcher`] — timeout-bounded, contiguous block fetching over any [`ChainSource`](chainreactor_core::ChainSource)
//! - [`jsonrpc`] — HTTP JSON-RPC chain source (`reqwest`)
//! - [`scripted`] — in-memory chain with scripted forks, for tests and simulation
//! - [`sinks`] — webhook, chain-transaction, and notification sinks plus the [`ActionRouter`]
//! - [`pipeline`] / [`worker`] — the assembled pipeline and its tokio worker loops
//! - [`builder`] — fluent [`PipelineBuilder`]

pub mod builder;
pub mod fetcher;
pub mod jsonrpc;
pub mod pipeline;
pub mod scripted;
pub mod sinks;
pub mod worker;

pub use builder::PipelineBuilder;
pub use fetcher::BlockFetcher;
pub use jsonrpc::{JsonRpcSource, RpcMethods};
pub use pipeline::{Pipeline, StepReport};
pub use scripted::ScriptedChain;
pub use sinks::{
    ActionRouter, ChainTxSink, DryRunSubmitter, LoggingNotifier, NotificationSink, Notifier, TxSubmitter,
    WebhookSink,
};
pub use worker::{PipelineHandle, Step, WorkerHandle};
