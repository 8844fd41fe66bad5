//! The `Engine` trait: the uniform call interface every AI/data engine fulfils.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::EngineError;

/// The core engine trait.
///
/// Implemented by the NLP parser, profiler, itinerary builder, budget
/// optimizer and every other capability wrapped by the orchestrator. The
/// orchestrator dispatches through `Arc<dyn Engine>` trait objects resolved
/// once at startup.
///
/// Implementations are expected to be pure functions of `inputs`: the
/// fingerprint cache relies on it.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Run the engine against its resolved inputs.
    ///
    /// `inputs` is an object of the form
    /// `{ "request": { <declared raw-input keys> }, "upstream": { <dependency>: <output> } }`.
    /// `timeout` is the budget the executor will enforce; engines that call
    /// out to providers should forward it to their HTTP client.
    async fn invoke(
        &self,
        name: &str,
        inputs: Value,
        timeout: Duration,
    ) -> Result<Value, EngineError>;
}
