//! Worker loops — one tokio task per pipeline component.
//!
//! Each loop runs its step, sleeps `poll_interval` when there was nothing to
//! do (or immediately runs again after progress), and exits when the shared
//! `watch` shutdown signal flips. Transient errors are logged and retried on
//! the next tick; fatal errors park the worker in [`WorkerState::Halted`]
//! until a later step succeeds (for example after an operator `resume`).

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use chainreactor_core::config::WorkerState;
use chainreactor_core::error::ReactorError;

/// What a single step accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Work was done; more may be pending.
    Progress,
    /// Nothing to do until the next poll.
    Idle,
}

/// A running worker.
pub struct WorkerHandle {
    name: &'static str,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }
}

/// Spawn `step` as a worker loop.
pub fn spawn_worker<F, Fut>(
    name: &'static str,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
    step: F,
) -> WorkerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Step, ReactorError>> + Send + 'static,
{
    let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
    let task = tokio::spawn(run_worker(name, poll_interval, shutdown, state_tx, step));
    WorkerHandle {
        name,
        state: state_rx,
        task,
    }
}

async fn run_worker<F, Fut>(
    name: &'static str,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    state: watch::Sender<WorkerState>,
    mut step: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Step, ReactorError>> + Send + 'static,
{
    state.send_replace(WorkerState::Running);
    tracing::info!(worker = name, "worker started");

    while !*shutdown.borrow() {
        let delay = match step().await {
            Ok(Step::Progress) => {
                state.send_replace(WorkerState::Running);
                None
            }
            Ok(Step::Idle) => {
                state.send_replace(WorkerState::Running);
                Some(poll_interval)
            }
            Err(err) if err.is_fatal() => {
                if state.send_replace(WorkerState::Halted) != WorkerState::Halted {
                    tracing::error!(worker = name, error = %err, "worker halted, operator action required");
                }
                Some(poll_interval)
            }
            Err(err) => {
                tracing::warn!(worker = name, error = %err, transient = err.is_transient(), "step failed, retrying");
                Some(poll_interval)
            }
        };

        match delay {
            None => tokio::task::yield_now().await,
            Some(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    state.send_replace(WorkerState::Stopping);
    tracing::info!(worker = name, "worker stopped");
    state.send_replace(WorkerState::Stopped);
}

/// Handle to a running pipeline: worker states and graceful shutdown.
pub struct PipelineHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<WorkerHandle>,
}

impl PipelineHandle {
    pub(crate) fn new(shutdown: watch::Sender<bool>, workers: Vec<WorkerHandle>) -> Self {
        Self { shutdown, workers }
    }

    /// Current state of every worker, in spawn order.
    pub fn states(&self) -> Vec<(&'static str, WorkerState)> {
        self.workers.iter().map(|w| (w.name(), w.state())).collect()
    }

    /// Signal every worker to stop and wait for them. In-flight steps finish
    /// first; nothing is committed half-way.
    pub async fn shutdown(self) -> Result<(), ReactorError> {
        self.shutdown.send_replace(true);
        for worker in self.workers {
            worker
                .task
                .await
                .map_err(|e| ReactorError::Other(format!("worker {} panicked: {e}", worker.name)))?;
        }
        Ok(())
    }
}
