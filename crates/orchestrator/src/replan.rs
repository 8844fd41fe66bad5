//! Replanning: selective re-execution after a change event.
//!
//! Only engines whose declared inputs changed, plus everything downstream of
//! them, are re-run. Every other result is copied verbatim from the prior
//! context and its engine is neither invoked nor re-fingerprinted.

use std::collections::BTreeSet;

use tracing::info;

use crate::planner;
use crate::{ChangeEvent, EngineRegistry, ExecutionContext, OrchestratorError, PipelineExecutor};

/// Engines of a prior run affected by a change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleSet {
    /// Engines reading one of the affected keys.
    pub direct: BTreeSet<String>,
    /// `direct` plus all their transitive dependents within the prior run.
    pub stale: BTreeSet<String>,
}

/// Compute the stale set of `prior` under `event`.
///
/// Keys carried in `updated_values` count as affected even when the event
/// does not list them in `affected_input_keys`.
pub fn stale_set(registry: &EngineRegistry, prior: &ExecutionContext, event: &ChangeEvent) -> StaleSet {
    let ran: BTreeSet<String> = prior.results().keys().cloned().collect();
    let affected: BTreeSet<String> = event
        .affected_input_keys
        .iter()
        .chain(event.updated_values.keys())
        .cloned()
        .collect();

    let direct: BTreeSet<String> = ran
        .iter()
        .filter(|name| {
            registry.descriptor(name).is_some_and(|descriptor| {
                !descriptor.reads.is_disjoint(&affected)
            })
        })
        .cloned()
        .collect();

    let stale = registry.dependents_closure(&direct, &ran);
    StaleSet { direct, stale }
}

/// Re-run the stale part of `prior` and splice it into a fresh context.
///
/// Directly affected engines bypass the cache read, since the world they
/// observe changed even when their fingerprint did not. Their dependents see
/// new upstream values and therefore new fingerprints.
///
/// # Errors
/// Configuration errors from planning, or executor invariant violations.
pub async fn replan(
    registry: &EngineRegistry,
    executor: &PipelineExecutor,
    prior: &ExecutionContext,
    event: &ChangeEvent,
) -> Result<ExecutionContext, OrchestratorError> {
    let StaleSet { direct, stale } = stale_set(registry, prior, event);
    info!(
        prior_request = %prior.request().request_id,
        affected = ?event.affected_input_keys,
        stale = ?stale,
        "replanning"
    );

    let mut ctx = ExecutionContext::new(prior.request().derive(&event.updated_values));
    for (name, result) in prior.results() {
        if !stale.contains(name) {
            ctx.record(name.clone(), result.clone())?;
        }
    }

    let plan = planner::plan(registry, &stale)?;
    executor.execute(&plan, &mut ctx, &direct).await?;
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use engines::mock::MockEngine;
    use serde_json::json;

    use crate::{EngineDescriptor, EngineResult, ExecutionRequest};

    fn registry() -> EngineRegistry {
        let mut registry = EngineRegistry::new();
        for descriptor in [
            EngineDescriptor::new("nlp").reads(["text"]),
            EngineDescriptor::new("weather").reads(["destination", "weather"]),
            EngineDescriptor::new("budget").depends_on(["nlp"]).reads(["budget"]),
            EngineDescriptor::new("itinerary").depends_on(["budget", "weather"]),
            EngineDescriptor::new("feedback").reads(["budget"]),
        ] {
            let engine = Arc::new(MockEngine::returning(descriptor.name.clone(), json!({})));
            registry.register(descriptor, engine).unwrap();
        }
        registry
    }

    fn prior() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(ExecutionRequest::new(["itinerary"], json!({}), "u-1"));
        for name in ["nlp", "weather", "budget", "itinerary"] {
            ctx.record(name, EngineResult::success(json!({}))).unwrap();
        }
        ctx
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn weather_change_marks_weather_and_dependents() {
        let stale = stale_set(&registry(), &prior(), &ChangeEvent::affecting(["weather"]));
        assert_eq!(stale.direct, set(&["weather"]));
        assert_eq!(stale.stale, set(&["weather", "itinerary"]));
    }

    #[test]
    fn engines_outside_the_prior_run_are_ignored() {
        // "feedback" reads budget but never ran.
        let stale = stale_set(&registry(), &prior(), &ChangeEvent::affecting(["budget"]));
        assert_eq!(stale.stale, set(&["budget", "itinerary"]));
    }

    #[test]
    fn updated_values_count_as_affected() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "affected_input_keys": [],
            "updated_values": { "budget": 800 }
        }))
        .unwrap();
        let stale = stale_set(&registry(), &prior(), &event);
        assert_eq!(stale.direct, set(&["budget"]));
        assert_eq!(stale.stale, set(&["budget", "itinerary"]));
    }

    #[test]
    fn unrelated_keys_leave_nothing_stale() {
        let stale = stale_set(&registry(), &prior(), &ChangeEvent::affecting(["currency"]));
        assert!(stale.direct.is_empty());
        assert!(stale.stale.is_empty());
    }
}
