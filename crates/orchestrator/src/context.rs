//! Per-run execution context and the run-level outcome derived from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{EngineRegistry, EngineResult, ExecutionRequest, FailureKind, OrchestratorError, Status};

/// Everything one run has produced so far.
///
/// Owned by exactly one in-flight run. Slots are write-once: the executor
/// records each engine's terminal result a single time, and the map only
/// grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    request: ExecutionRequest,
    results: BTreeMap<String, EngineResult>,
    /// Waves actually executed by this run (seeded results aren't listed).
    waves: Vec<Vec<String>>,
}

impl ExecutionContext {
    pub fn new(request: ExecutionRequest) -> Self {
        Self {
            request,
            results: BTreeMap::new(),
            waves: Vec::new(),
        }
    }

    pub fn request(&self) -> &ExecutionRequest {
        &self.request
    }

    pub fn result(&self, engine: &str) -> Option<&EngineResult> {
        self.results.get(engine)
    }

    pub fn results(&self) -> &BTreeMap<String, EngineResult> {
        &self.results
    }

    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    /// Write `engine`'s terminal result.
    ///
    /// # Errors
    /// [`OrchestratorError::ResultAlreadyRecorded`] if the slot is taken.
    pub fn record(&mut self, engine: impl Into<String>, result: EngineResult) -> Result<(), OrchestratorError> {
        let engine = engine.into();
        if self.results.contains_key(&engine) {
            return Err(OrchestratorError::ResultAlreadyRecorded(engine));
        }
        self.results.insert(engine, result);
        Ok(())
    }

    pub(crate) fn push_wave(&mut self, wave: Vec<String>) {
        self.waves.push(wave);
    }

    /// Classify the run against its goal.
    ///
    /// `Failed` if any goal engine failed, `Degraded` if a goal or one of its
    /// transitive dependencies fell back, `Success` otherwise.
    pub fn outcome(&self, registry: &EngineRegistry) -> RunOutcome {
        let chains: Vec<FailureChain> = self
            .request
            .goal
            .iter()
            .filter_map(|goal| self.failure_chain(goal))
            .collect();
        if !chains.is_empty() {
            return RunOutcome::Failed { chains };
        }

        let scope = registry.resolve(self.request.goal.as_slice()).unwrap_or_default();
        let manifest: Vec<DegradedComponent> = scope
            .iter()
            .filter_map(|name| match self.results.get(name) {
                Some(EngineResult::Degraded { reason, .. }) => Some(DegradedComponent {
                    engine: name.clone(),
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect();
        if !manifest.is_empty() {
            return RunOutcome::Degraded { manifest };
        }

        RunOutcome::Success
    }

    fn failure_chain(&self, goal: &str) -> Option<FailureChain> {
        let cause = match self.results.get(goal) {
            Some(EngineResult::Failed { cause }) => cause.clone(),
            Some(_) => return None,
            None => {
                return Some(FailureChain {
                    goal: goal.to_owned(),
                    root_engine: goal.to_owned(),
                    kind: FailureKind::Timeout,
                    message: "goal engine never produced a result".into(),
                })
            }
        };

        // Upstream failures point at the root engine; report its own kind.
        let root = match self.results.get(&cause.engine).and_then(EngineResult::cause) {
            Some(root) if root.kind != FailureKind::UpstreamFailure => root.clone(),
            _ => cause,
        };

        Some(FailureChain {
            goal: goal.to_owned(),
            root_engine: root.engine,
            kind: root.kind,
            message: root.message,
        })
    }
}

// ---------------------------------------------------------------------------
// Run outcome
// ---------------------------------------------------------------------------

/// Diagnosis of a failed goal: enough to explain the failure without
/// re-running anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureChain {
    pub goal: String,
    pub root_engine: String,
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for FailureChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "goal '{}' failed: root cause '{}' ({}): {}",
            self.goal, self.root_engine, self.kind, self.message
        )
    }
}

/// One engine that fell back to its default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedComponent {
    pub engine: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Degraded { manifest: Vec<DegradedComponent> },
    Failed { chains: Vec<FailureChain> },
}

impl RunOutcome {
    pub fn status(&self) -> Status {
        match self {
            Self::Success => Status::Success,
            Self::Degraded { .. } => Status::Degraded,
            Self::Failed { .. } => Status::Failed,
        }
    }

    /// Turn a failed outcome into a hard error for callers that want `?`.
    ///
    /// # Errors
    /// [`OrchestratorError::GoalFailed`] with the first failing goal's chain.
    pub fn into_result(self) -> Result<Self, OrchestratorError> {
        match self {
            Self::Failed { mut chains } if !chains.is_empty() => {
                Err(OrchestratorError::GoalFailed(chains.swap_remove(0)))
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use engines::mock::MockEngine;
    use serde_json::json;

    use crate::EngineDescriptor;

    fn registry() -> EngineRegistry {
        let mut registry = EngineRegistry::new();
        for descriptor in [
            EngineDescriptor::new("nlp"),
            EngineDescriptor::new("budget").depends_on(["nlp"]),
            EngineDescriptor::new("itinerary").depends_on(["budget"]),
        ] {
            let engine = Arc::new(MockEngine::returning(descriptor.name.clone(), json!({})));
            registry.register(descriptor, engine).unwrap();
        }
        registry
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new(ExecutionRequest::new(["itinerary"], json!({}), "u-1"))
    }

    #[test]
    fn slots_are_write_once() {
        let mut ctx = context();
        ctx.record("nlp", EngineResult::success(json!({}))).unwrap();
        assert!(matches!(
            ctx.record("nlp", EngineResult::success(json!({ "again": true }))),
            Err(OrchestratorError::ResultAlreadyRecorded(name)) if name == "nlp"
        ));
        assert_eq!(ctx.result("nlp").and_then(EngineResult::value), Some(&json!({})));
    }

    #[test]
    fn degraded_dependency_degrades_the_run() {
        let mut ctx = context();
        ctx.record("nlp", EngineResult::Degraded { value: json!({}), reason: "fallback".into() })
            .unwrap();
        ctx.record("budget", EngineResult::success(json!({}))).unwrap();
        ctx.record("itinerary", EngineResult::success(json!({}))).unwrap();

        let outcome = ctx.outcome(&registry());
        assert_eq!(outcome.status(), Status::Degraded);
        assert!(matches!(
            outcome,
            RunOutcome::Degraded { manifest } if manifest.len() == 1 && manifest[0].engine == "nlp"
        ));
    }

    #[test]
    fn failed_goal_reports_root_cause() {
        let mut ctx = context();
        ctx.record("nlp", EngineResult::success(json!({}))).unwrap();
        ctx.record("budget", EngineResult::failed("budget", FailureKind::Permanent, "no prices"))
            .unwrap();
        ctx.record(
            "itinerary",
            EngineResult::failed("budget", FailureKind::UpstreamFailure, "dependency 'budget' failed"),
        )
        .unwrap();

        let err = ctx.outcome(&registry()).into_result().unwrap_err();
        match err {
            OrchestratorError::GoalFailed(chain) => {
                assert_eq!(chain.goal, "itinerary");
                assert_eq!(chain.root_engine, "budget");
                assert_eq!(chain.kind, FailureKind::Permanent);
                assert_eq!(chain.message, "no prices");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
