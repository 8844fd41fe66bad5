//! Pipeline executor.
//!
//! `PipelineExecutor` runs an [`ExecutionPlan`] against an
//! [`ExecutionContext`]:
//! 1. Waves run strictly one after another; engines inside a wave run
//!    concurrently and only read the context.
//! 2. Each engine resolves its inputs (declared request keys + upstream
//!    values), checks the fingerprint cache, and on a miss invokes the engine
//!    through the `Engine` trait with a per-attempt timeout.
//! 3. `Transient` / `RateLimited` errors and attempt timeouts are retried with
//!    exponential back-off up to `max_retries`; afterwards the descriptor's
//!    fallback yields `Degraded`, otherwise `Failed`.
//! 4. Engines whose dependency `Failed` are recorded as `UpstreamFailure`
//!    without being invoked.
//! 5. One deadline covers the whole run; engines still running when it
//!    passes are cancelled and recorded as `Timeout`, and later waves are
//!    not invoked.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use engines::{Engine, EngineError};

use crate::config::ExecutorConfig;
use crate::planner::ExecutionPlan;
use crate::{
    ConfigurationError, EngineDescriptor, EngineRegistry, EngineResult, ExecutionContext,
    FailureCause, FailureKind, FingerprintCache, OrchestratorError,
};

/// Why the last attempt of an engine failed.
#[derive(Debug)]
struct AttemptFailure {
    kind: FailureKind,
    message: String,
    attempts: u32,
    /// Retries ran out (as opposed to a non-retryable error).
    exhausted: bool,
}

/// Stateless runner; one per process, shared by every request.
pub struct PipelineExecutor {
    registry: Arc<EngineRegistry>,
    cache: FingerprintCache,
    config: ExecutorConfig,
}

impl PipelineExecutor {
    pub fn new(registry: Arc<EngineRegistry>, cache: FingerprintCache, config: &ExecutorConfig) -> Self {
        Self {
            registry,
            cache,
            config: config.clone(),
        }
    }

    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    /// Run every wave of `plan`, recording one terminal result per engine.
    ///
    /// Engines named in `refresh` skip the cache read (their result still
    /// refreshes the cache entry).
    ///
    /// # Errors
    /// Only structural problems: an engine missing from the registry, or a
    /// slot that was already recorded. Engine failures are data in `ctx`.
    #[instrument(skip_all, fields(request_id = %ctx.request().request_id, waves = plan.waves().len()))]
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        ctx: &mut ExecutionContext,
        refresh: &BTreeSet<String>,
    ) -> Result<(), OrchestratorError> {
        let deadline = Instant::now() + self.config.run_deadline;

        for (idx, wave) in plan.waves().iter().enumerate() {
            let mut settled: Vec<(String, EngineResult)> = Vec::new();
            let mut running = Vec::new();

            for name in wave {
                let descriptor = self
                    .registry
                    .descriptor(name)
                    .ok_or_else(|| ConfigurationError::UnknownEngine(name.clone()))?;
                let engine = self
                    .registry
                    .engine(name)
                    .ok_or_else(|| ConfigurationError::UnknownEngine(name.clone()))?;

                if let Some(cause) = upstream_failure(descriptor, ctx) {
                    debug!(engine = %name, root = %cause.engine, "skipping: upstream failure");
                    settled.push((name.clone(), EngineResult::Failed { cause }));
                    continue;
                }
                if Instant::now() >= deadline {
                    settled.push((
                        name.clone(),
                        EngineResult::failed(name, FailureKind::Timeout, "run deadline exceeded before start"),
                    ));
                    continue;
                }

                let inputs = resolve_inputs(descriptor, ctx);
                running.push(self.run_engine(descriptor, engine, inputs, refresh.contains(name), deadline));
            }

            info!(wave = idx, engines = ?wave, invoked = running.len(), "starting wave");
            settled.extend(join_all(running).await);

            for (name, result) in settled {
                if let EngineResult::Failed { cause } = &result {
                    error!(engine = %name, kind = %cause.kind, root = %cause.engine, "engine failed: {}", cause.message);
                }
                ctx.record(name, result)?;
            }
            ctx.push_wave(wave.clone());
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal: one engine, bounded by the run deadline.
    // -----------------------------------------------------------------------

    async fn run_engine(
        &self,
        descriptor: &EngineDescriptor,
        engine: Arc<dyn Engine>,
        inputs: Value,
        refresh: bool,
        deadline: Instant,
    ) -> (String, EngineResult) {
        let name = descriptor.name.clone();
        let attempt = self.resolve_engine(descriptor, engine.as_ref(), inputs, refresh);

        let result = match tokio::time::timeout_at(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => {
                warn!(engine = %name, "cancelled by run deadline");
                EngineResult::failed(&name, FailureKind::Timeout, "run deadline exceeded")
            }
        };
        (name, result)
    }

    async fn resolve_engine(
        &self,
        descriptor: &EngineDescriptor,
        engine: &dyn Engine,
        inputs: Value,
        refresh: bool,
    ) -> EngineResult {
        let name = descriptor.name.as_str();
        let use_cache = descriptor.cacheable && self.cache.is_enabled();

        if use_cache && !refresh {
            if let Some(hit) = self.cache.get(name, &inputs).await {
                info!(engine = name, "served from cache");
                return hit;
            }
        }

        match self.invoke_with_retry(descriptor, engine, &inputs).await {
            Ok(value) => {
                let result = EngineResult::success(value);
                if use_cache {
                    self.cache
                        .put(name, &inputs, &result, self.cache.ttl_for(descriptor))
                        .await;
                }
                info!(engine = name, "engine succeeded");
                result
            }
            Err(failure) => self.settle_failure(descriptor, failure),
        }
    }

    fn settle_failure(&self, descriptor: &EngineDescriptor, failure: AttemptFailure) -> EngineResult {
        let name = descriptor.name.as_str();
        match (&descriptor.fallback, failure.exhausted) {
            (Some(value), true) => {
                let reason = format!(
                    "{} after {} attempt(s): {}",
                    failure.kind, failure.attempts, failure.message
                );
                warn!(engine = name, %reason, "engine degraded to fallback");
                EngineResult::Degraded {
                    value: value.clone(),
                    reason,
                }
            }
            _ => EngineResult::failed(name, failure.kind, failure.message),
        }
    }

    // -----------------------------------------------------------------------
    // Internal: retry loop around a single engine.
    // -----------------------------------------------------------------------

    async fn invoke_with_retry(
        &self,
        descriptor: &EngineDescriptor,
        engine: &dyn Engine,
        inputs: &Value,
    ) -> Result<Value, AttemptFailure> {
        let name = descriptor.name.as_str();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let call = engine.invoke(name, inputs.clone(), descriptor.timeout);

            let (kind, message, retry_after) = match tokio::time::timeout(descriptor.timeout, call).await {
                Ok(Ok(value)) => {
                    return check_produces(descriptor, value).map_err(|message| AttemptFailure {
                        kind: FailureKind::Permanent,
                        message,
                        attempts,
                        exhausted: false,
                    });
                }
                Ok(Err(err)) if !err.is_retryable() => {
                    return Err(AttemptFailure {
                        kind: err.kind().into(),
                        message: err.message().to_owned(),
                        attempts,
                        exhausted: false,
                    });
                }
                Ok(Err(err)) => retryable_parts(err),
                Err(_) => (
                    FailureKind::Timeout,
                    format!("no response within {:?}", descriptor.timeout),
                    None,
                ),
            };

            if attempts > descriptor.max_retries {
                return Err(AttemptFailure {
                    kind,
                    message,
                    attempts,
                    exhausted: true,
                });
            }

            let delay = self.backoff_delay(attempts, retry_after);
            warn!(
                "engine '{}' {} error (attempt {}/{}), retrying in {:?}: {}",
                name,
                kind,
                attempts,
                descriptor.max_retries + 1,
                delay,
                message
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// `base * 2^(attempt-1)` capped at `max_backoff`; a provider hint wins.
    fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.config
            .retry_base_delay
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }
}

fn retryable_parts(err: EngineError) -> (FailureKind, String, Option<Duration>) {
    (err.kind().into(), err.message().to_owned(), err.retry_after())
}

/// First failed dependency, as an `UpstreamFailure` pointing at the root.
fn upstream_failure(descriptor: &EngineDescriptor, ctx: &ExecutionContext) -> Option<FailureCause> {
    descriptor.depends_on.iter().find_map(|dep| match ctx.result(dep) {
        Some(EngineResult::Failed { cause }) => Some(FailureCause {
            kind: FailureKind::UpstreamFailure,
            engine: cause.engine.clone(),
            message: format!("dependency '{dep}' failed"),
        }),
        Some(_) => None,
        None => Some(FailureCause {
            kind: FailureKind::UpstreamFailure,
            engine: dep.clone(),
            message: format!("dependency '{dep}' has no result"),
        }),
    })
}

/// `{ "request": {declared keys}, "upstream": {dependency: value} }`
fn resolve_inputs(descriptor: &EngineDescriptor, ctx: &ExecutionContext) -> Value {
    let upstream = descriptor
        .depends_on
        .iter()
        .filter_map(|dep| {
            ctx.result(dep)
                .and_then(EngineResult::value)
                .map(|value| (dep.clone(), value.clone()))
        })
        .collect::<Map<_, _>>();

    let mut inputs = Map::new();
    inputs.insert("request".into(), ctx.request().declared_inputs(&descriptor.reads));
    inputs.insert("upstream".into(), Value::Object(upstream));
    Value::Object(inputs)
}

/// The output must be an object carrying every declared `produces` key.
fn check_produces(descriptor: &EngineDescriptor, value: Value) -> Result<Value, String> {
    if descriptor.produces.is_empty() {
        return Ok(value);
    }
    let Some(fields) = value.as_object() else {
        return Err(format!("output is not an object (expected keys {:?})", descriptor.produces));
    };
    if let Some(missing) = descriptor.produces.iter().find(|key| !fields.contains_key(*key)) {
        return Err(format!("output is missing declared key '{missing}'"));
    }
    Ok(value)
}
