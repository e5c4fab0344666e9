//! The assembled pipeline: reconciler, projector, trigger engine, and action
//! executor sharing one store.
//!
//! Components never call each other. Each step reads what the previous stage
//! durably committed, so the steps can run as independent workers
//! ([`Pipeline::spawn`]) or in lock-step ([`Pipeline::step_all`]).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use chainreactor_core::action::ActionSink;
use chainreactor_core::config::PipelineConfig;
use chainreactor_core::error::{with_timeout, ReactorError};
use chainreactor_core::executor::{ActionExecutor, ExecutorReport};
use chainreactor_core::health::{health_report, HealthReport};
use chainreactor_core::metrics::ReactorMetrics;
use chainreactor_core::projector::{Projector, ProjectorReport};
use chainreactor_core::reconciler::{ReconcileOutcome, Reconciler};
use chainreactor_core::source::ChainSource;
use chainreactor_core::store::ReactorStore;
use chainreactor_core::trigger::{RuleSource, TriggerEngine, TriggerReport};

use crate::fetcher::BlockFetcher;
use crate::worker::{spawn_worker, PipelineHandle, Step};

/// What one [`Pipeline::step_all`] round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub reconcile: ReconcileOutcome,
    pub projector: ProjectorReport,
    pub triggers: TriggerReport,
    pub executor: ExecutorReport,
}

impl StepReport {
    /// Returns `true` if any stage did work.
    pub fn made_progress(&self) -> bool {
        self.reconcile.adopted > 0
            || self.reconcile.orphaned > 0
            || self.reconcile.confirmed > 0
            || consumed(&self.projector) > 0
            || self.triggers.evaluated + self.triggers.skipped > 0
            || self.executor.claimed + self.executor.dead > 0
    }
}

fn consumed(report: &ProjectorReport) -> u64 {
    report.applied + report.already_applied + report.skipped
}

pub struct Pipeline<S: ?Sized, C: ?Sized> {
    config: PipelineConfig,
    store: Arc<S>,
    fetcher: Arc<BlockFetcher<C>>,
    reconciler: Reconciler<S, BlockFetcher<C>>,
    projector: Projector<S>,
    triggers: TriggerEngine<S, dyn RuleSource>,
    executor: ActionExecutor<S, dyn ActionSink>,
}

impl<S, C> Pipeline<S, C>
where
    S: ReactorStore + ?Sized + 'static,
    C: ChainSource + ?Sized + 'static,
{
    pub fn new(
        config: PipelineConfig,
        store: Arc<S>,
        source: Arc<C>,
        rules: Arc<dyn RuleSource>,
        sink: Arc<dyn ActionSink>,
        metrics: ReactorMetrics,
    ) -> Result<Self, ReactorError> {
        config.validate()?;
        let fetcher = Arc::new(BlockFetcher::new(source, config.source_timeout_ms));
        Ok(Self {
            reconciler: Reconciler::new(Arc::clone(&store), Arc::clone(&fetcher), &config)
                .with_metrics(metrics.clone()),
            projector: Projector::new(Arc::clone(&store), config.consumer_batch_size).with_metrics(metrics.clone()),
            triggers: TriggerEngine::new(Arc::clone(&store), rules, config.consumer_batch_size)
                .with_metrics(metrics.clone()),
            executor: ActionExecutor::new(Arc::clone(&store), sink, &config.executor).with_metrics(metrics),
            fetcher,
            store,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn reconciler(&self) -> &Reconciler<S, BlockFetcher<C>> {
        &self.reconciler
    }

    /// Fetch the next window of blocks and reconcile it, within the
    /// reconcile budget. The pass commits once at its end, so a pass cut
    /// short by the budget leaves no partial state.
    pub async fn reconcile_step(&self) -> Result<ReconcileOutcome, ReactorError> {
        with_timeout("reconcile", self.config.reconcile_budget_ms, self.reconcile_window()).await
    }

    async fn reconcile_window(&self) -> Result<ReconcileOutcome, ReactorError> {
        let head = self.fetcher.head_height().await?;
        let cursor = self.reconciler.cursor().await?;
        if let Some(reason) = cursor.as_ref().and_then(|c| c.halted.clone()) {
            return Err(ReactorError::Halted { reason });
        }
        let from = match cursor.as_ref().and_then(|c| c.next_height()) {
            Some(next) => next,
            None => self.config.start_height.unwrap_or(head),
        };
        if from > head {
            return self.reconciler.observe_with_head(vec![], head).await;
        }
        let to = head.min(from + self.config.fetch_batch_size.max(1) - 1);
        let blocks = self.fetcher.range(from, to).await?;
        self.reconciler.observe_with_head(blocks, head).await
    }

    pub async fn project_step(&self) -> Result<ProjectorReport, ReactorError> {
        with_timeout("project", self.config.store_timeout_ms, self.projector.run_once()).await
    }

    pub async fn trigger_step(&self) -> Result<TriggerReport, ReactorError> {
        with_timeout("trigger", self.config.store_timeout_ms, self.triggers.run_once()).await
    }

    pub async fn execute_step(&self) -> Result<ExecutorReport, ReactorError> {
        let budget = self.config.executor.action_timeout_ms + self.config.store_timeout_ms;
        with_timeout("execute", budget, self.executor.run_once()).await
    }

    /// Run every stage once, in pipeline order.
    pub async fn step_all(&self) -> Result<StepReport, ReactorError> {
        Ok(StepReport {
            reconcile: self.reconcile_step().await?,
            projector: self.project_step().await?,
            triggers: self.trigger_step().await?,
            executor: self.execute_step().await?,
        })
    }

    /// Step until a round makes no progress or `max_rounds` is reached.
    /// Returns the number of rounds run.
    pub async fn drain(&self, max_rounds: usize) -> Result<usize, ReactorError> {
        for round in 1..=max_rounds {
            if !self.step_all().await?.made_progress() {
                return Ok(round);
            }
        }
        Ok(max_rounds)
    }

    pub async fn health(&self) -> Result<HealthReport, ReactorError> {
        health_report(self.store.as_ref(), &self.config.chain).await
    }

    /// Run each stage as its own worker until the handle is shut down.
    pub fn spawn(self: Arc<Self>) -> PipelineHandle {
        let (tx, rx) = watch::channel(false);
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        tracing::info!(chain = %self.config.chain, poll_ms = self.config.poll_interval_ms, "starting pipeline workers");

        let p = Arc::clone(&self);
        let reconciler = spawn_worker("reconciler", interval, rx.clone(), move || {
            let p = Arc::clone(&p);
            async move {
                let outcome = p.reconcile_step().await?;
                Ok::<_, ReactorError>(if outcome.adopted > 0 { Step::Progress } else { Step::Idle })
            }
        });

        let p = Arc::clone(&self);
        let projector = spawn_worker("projector", interval, rx.clone(), move || {
            let p = Arc::clone(&p);
            async move {
                let report = p.project_step().await?;
                Ok::<_, ReactorError>(if consumed(&report) > 0 { Step::Progress } else { Step::Idle })
            }
        });

        let p = Arc::clone(&self);
        let triggers = spawn_worker("triggers", interval, rx.clone(), move || {
            let p = Arc::clone(&p);
            async move {
                let report = p.trigger_step().await?;
                Ok::<_, ReactorError>(if report.evaluated + report.skipped > 0 { Step::Progress } else { Step::Idle })
            }
        });

        let p = Arc::clone(&self);
        let executor = spawn_worker("executor", interval, rx, move || {
            let p = Arc::clone(&p);
            async move {
                let report = p.execute_step().await?;
                Ok::<_, ReactorError>(if report.claimed + report.dead > 0 { Step::Progress } else { Step::Idle })
            }
        });

        PipelineHandle::new(tx, vec![reconciler, projector, triggers, executor])
    }
}
