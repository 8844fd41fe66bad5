//! `MockEngine`: a test double for `Engine`.
//!
//! Useful in unit and integration tests where a real model or provider
//! client is either unavailable or irrelevant, and for dry-running a
//! pipeline from the CLI.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Engine, EngineError};

type ComputeFn = dyn Fn(&Value) -> Value + Send + Sync;

/// Behaviour injected into `MockEngine` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Derive the output from the resolved inputs.
    Compute(Box<ComputeFn>),
    /// Always fail with the given error.
    Fail(EngineError),
    /// Play back outcomes in order; the last one repeats once the script runs out.
    Script(Mutex<VecDeque<Result<Value, EngineError>>>),
    /// Sleep before returning a value (for timeout tests).
    Delayed(Duration, Value),
}

/// A mock engine that records every call it receives and returns a
/// programmer-specified result.
pub struct MockEngine {
    /// Label used in test assertions.
    pub name: String,
    /// What the engine will do when `invoke` is called.
    pub behaviour: MockBehaviour,
    /// All inputs seen by this engine (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl MockEngine {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock whose output is computed from its inputs.
    pub fn computing(
        name: impl Into<String>,
        f: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self::with(name, MockBehaviour::Compute(Box::new(f)))
    }

    /// Create a mock that always fails with a `Transient` error.
    pub fn failing_transient(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Fail(EngineError::Transient(msg.into())))
    }

    /// Create a mock that always fails with a `Permanent` error.
    pub fn failing_permanent(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Fail(EngineError::Permanent(msg.into())))
    }

    /// Create a mock that always fails with the given error.
    pub fn failing(name: impl Into<String>, error: EngineError) -> Self {
        Self::with(name, MockBehaviour::Fail(error))
    }

    /// Create a mock that plays back `outcomes` one call at a time.
    pub fn scripted(
        name: impl Into<String>,
        outcomes: impl IntoIterator<Item = Result<Value, EngineError>>,
    ) -> Self {
        let script = outcomes.into_iter().collect::<VecDeque<_>>();
        Self::with(name, MockBehaviour::Script(Mutex::new(script)))
    }

    /// Create a mock that takes `delay` to answer.
    pub fn delayed(name: impl Into<String>, delay: Duration, value: Value) -> Self {
        Self::with(name, MockBehaviour::Delayed(delay, value))
    }

    /// Number of times this engine has been invoked.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Inputs of the most recent invocation.
    pub fn last_input(&self) -> Option<Value> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn invoke(
        &self,
        _name: &str,
        inputs: Value,
        _timeout: Duration,
    ) -> Result<Value, EngineError> {
        self.calls.lock().unwrap().push(inputs.clone());

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(v.clone()),
            MockBehaviour::Compute(f) => Ok(f(&inputs)),
            MockBehaviour::Fail(err) => Err(err.clone()),
            MockBehaviour::Script(script) => {
                let mut script = script.lock().unwrap();
                match script.len() {
                    0 => Err(EngineError::Permanent(format!("{}: empty script", self.name))),
                    1 => script[0].clone(),
                    _ => script.pop_front().unwrap(),
                }
            }
            MockBehaviour::Delayed(delay, v) => {
                tokio::time::sleep(*delay).await;
                Ok(v.clone())
            }
        }
    }
}
