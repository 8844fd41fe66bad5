//! `Orchestrator`: the two entry points the routing layer calls.
//!
//! `run_pipeline` resolves a goal to its engine closure, plans it into
//! waves and executes it. `replan` re-runs only what a change event made
//! stale. Both emit a [`RunSummary`] when a sink is attached.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument};

use crate::cache::FingerprintCache;
use crate::config::OrchestratorConfig;
use crate::store::CacheStore;
use crate::summary::{RunSummary, SummarySink};
use crate::{
    planner, replan, ChangeEvent, EngineRegistry, ExecutionContext, ExecutionRequest,
    OrchestratorError, PipelineExecutor, RunOutcome,
};

pub struct Orchestrator {
    registry: Arc<EngineRegistry>,
    executor: PipelineExecutor,
    sink: Option<Arc<dyn SummarySink>>,
}

impl Orchestrator {
    /// Freeze `registry` and wire it to `store`.
    pub fn new(registry: EngineRegistry, store: Arc<dyn CacheStore>, config: &OrchestratorConfig) -> Self {
        let registry = Arc::new(registry);
        let cache = FingerprintCache::new(store, &config.cache);
        let executor = PipelineExecutor::new(Arc::clone(&registry), cache, &config.executor);
        Self {
            registry,
            executor,
            sink: None,
        }
    }

    /// Emit a summary to `sink` after every run.
    pub fn with_sink(mut self, sink: Arc<dyn SummarySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &FingerprintCache {
        self.executor.cache()
    }

    /// Run `goal` for `user_id` against `raw_input`.
    ///
    /// # Errors
    /// Configuration errors only; engine failures are inspected through
    /// [`outcome`](Self::outcome).
    pub async fn run_pipeline(
        &self,
        goal: &str,
        raw_input: Value,
        user_id: &str,
    ) -> Result<ExecutionContext, OrchestratorError> {
        self.run(ExecutionRequest::new([goal], raw_input, user_id)).await
    }

    /// Run an already-built request (possibly with several goals).
    #[instrument(skip_all, fields(request_id = %request.request_id, goal = ?request.goal))]
    pub async fn run(&self, request: ExecutionRequest) -> Result<ExecutionContext, OrchestratorError> {
        let required = self.registry.resolve(request.goal.as_slice())?;
        let plan = planner::plan(&self.registry, &required)?;
        info!(waves = ?plan.waves(), "execution plan ready");

        let mut ctx = ExecutionContext::new(request);
        self.executor.execute(&plan, &mut ctx, &BTreeSet::new()).await?;
        self.finish(&ctx).await;
        Ok(ctx)
    }

    /// Re-run what `event` made stale in `prior`.
    ///
    /// # Errors
    /// Configuration errors only.
    #[instrument(skip_all, fields(prior_request = %prior.request().request_id))]
    pub async fn replan(
        &self,
        prior: &ExecutionContext,
        event: &ChangeEvent,
    ) -> Result<ExecutionContext, OrchestratorError> {
        let ctx = replan::replan(&self.registry, &self.executor, prior, event).await?;
        self.finish(&ctx).await;
        Ok(ctx)
    }

    pub fn outcome(&self, ctx: &ExecutionContext) -> RunOutcome {
        ctx.outcome(&self.registry)
    }

    async fn finish(&self, ctx: &ExecutionContext) {
        let outcome = self.outcome(ctx);
        info!(status = %outcome.status(), engines = ctx.results().len(), "run finished");
        if let Some(sink) = &self.sink {
            sink.emit(&RunSummary::new(ctx, &outcome)).await;
        }
    }
}
