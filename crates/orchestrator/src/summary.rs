//! Run summaries handed to the persistence layer.
//!
//! The core never touches storage; it emits one [`RunSummary`] per completed
//! run to a [`SummarySink`] and lets the surrounding system decide where it
//! goes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{EngineResult, ExecutionContext, FailureCause, RunOutcome, Status};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOutcome {
    pub status: Status,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
}

impl From<&EngineResult> for EngineOutcome {
    fn from(result: &EngineResult) -> Self {
        let reason = match result {
            EngineResult::Degraded { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        Self {
            status: result.status(),
            from_cache: result.from_cache(),
            reason,
            cause: result.cause().cloned(),
        }
    }
}

/// `{requestId, goal, perEngineOutcomes, finalStatus}` for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub request_id: Uuid,
    pub user_id: String,
    pub goal: Vec<String>,
    pub per_engine_outcomes: BTreeMap<String, EngineOutcome>,
    pub final_status: Status,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replanned_from: Option<Uuid>,
}

impl RunSummary {
    pub fn new(ctx: &ExecutionContext, outcome: &RunOutcome) -> Self {
        let request = ctx.request();
        Self {
            request_id: request.request_id,
            user_id: request.user_id.clone(),
            goal: request.goal.clone(),
            per_engine_outcomes: ctx
                .results()
                .iter()
                .map(|(name, result)| (name.clone(), EngineOutcome::from(result)))
                .collect(),
            final_status: outcome.status(),
            outcome: outcome.clone(),
            replanned_from: request.replanned_from,
        }
    }
}

/// Receives a summary after every run.
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn emit(&self, summary: &RunSummary);
}

/// Writes summaries to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl SummarySink for LogSink {
    async fn emit(&self, summary: &RunSummary) {
        let encoded = serde_json::to_string(summary).unwrap_or_default();
        info!(
            request_id = %summary.request_id,
            status = %summary.final_status,
            summary = %encoded,
            "run completed"
        );
    }
}
