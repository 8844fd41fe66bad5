//! `orchestrator` crate: engine registry, wave planning, fingerprint cache,
//! the pipeline executor and replanning.

pub mod models;
pub mod error;
pub mod config;
pub mod registry;
pub mod planner;
pub mod fingerprint;
pub mod store;
pub mod cache;
pub mod context;
pub mod executor;
pub mod replan;
pub mod summary;
pub mod pipeline;

pub use models::{
    ChangeEvent, EngineDescriptor, EngineResult, ExecutionRequest, FailureCause, FailureKind, Status,
};
pub use error::{CacheError, ConfigurationError, OrchestratorError};
pub use config::{CacheConfig, ExecutorConfig, OrchestratorConfig};
pub use registry::EngineRegistry;
pub use planner::{plan, ExecutionPlan};
pub use store::{CacheStore, InMemoryStore};
pub use cache::{CacheEntry, CacheStats, FingerprintCache};
pub use context::{DegradedComponent, ExecutionContext, FailureChain, RunOutcome};
pub use executor::PipelineExecutor;
pub use summary::{LogSink, RunSummary, SummarySink};
pub use pipeline::Orchestrator;
