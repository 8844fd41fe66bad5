//! Orchestrator-level error types.
//!
//! Engine failures are *not* errors here: they are recorded as
//! [`EngineResult::Failed`](crate::EngineResult) data inside the execution
//! context. These types cover what the caller must see as a hard failure.

use thiserror::Error;

use crate::context::FailureChain;

/// Registry or plan misconfiguration. Raised at startup (registration) or
/// when a request names something the registry doesn't know.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// Engine names must not contain the cache key separator `:`.
    #[error("engine name '{0}' must not contain ':'")]
    InvalidEngineName(String),

    /// Two descriptors share a name.
    #[error("engine '{0}' is already registered")]
    DuplicateEngine(String),

    /// A descriptor depends on a name that isn't registered.
    #[error("engine '{engine}' depends on unknown engine '{dependency}'")]
    InvalidDependency { engine: String, dependency: String },

    /// The requested goal isn't a registered engine.
    #[error("unknown goal engine '{0}'")]
    UnknownGoal(String),

    /// A plan referenced an engine the registry doesn't hold.
    #[error("unknown engine '{0}'")]
    UnknownEngine(String),

    /// Topological layering could not place these engines.
    #[error("dependency cycle among engines: {}", engines.join(", "))]
    CyclicDependency { engines: Vec<String> },
}

/// Errors surfaced to the caller of the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// The requested goal engine ended up `Failed`.
    #[error("{0}")]
    GoalFailed(FailureChain),

    /// Attempted a second write to an engine's slot within one run.
    #[error("result for engine '{0}' was already recorded in this run")]
    ResultAlreadyRecorded(String),
}

/// Failures of the backing cache store.
///
/// The fingerprint cache treats these as misses (and logs them); they never
/// fail a run.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("cache store unavailable: {0}")]
    Store(String),
}
