//! Core domain models for the orchestration core.
//!
//! These types describe engines, the requests that drive them and the
//! results they leave behind. All of them serialise to JSON so a run can be
//! summarised, logged or handed to the persistence layer as-is.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use engines::ErrorKind;

use crate::config::{duration_ms, opt_duration_secs};

// ---------------------------------------------------------------------------
// EngineDescriptor
// ---------------------------------------------------------------------------

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Static declaration of one engine: what it needs, what it yields and how
/// the executor should treat it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    /// Unique engine name (the dispatch key).
    pub name: String,
    /// Engines whose outputs this engine consumes.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Raw-input keys this engine reads from the request payload.
    #[serde(default)]
    pub reads: BTreeSet<String>,
    /// Keys the engine's output object must contain.
    #[serde(default)]
    pub produces: BTreeSet<String>,
    /// Budget for a single attempt.
    #[serde(rename = "timeout_ms", with = "duration_ms", default = "default_timeout")]
    pub timeout: Duration,
    /// Retries after the first attempt for transient failures.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub cacheable: bool,
    /// Overrides the configured default TTL.
    #[serde(rename = "cache_ttl_secs", with = "opt_duration_secs", default)]
    pub cache_ttl: Option<Duration>,
    /// Static value substituted when retries are exhausted.
    #[serde(default)]
    pub fallback: Option<Value>,
}

impl EngineDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: BTreeSet::new(),
            reads: BTreeSet::new(),
            produces: BTreeSet::new(),
            timeout: default_timeout(),
            max_retries: 0,
            cacheable: false,
            cache_ttl: None,
            fallback: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn reads<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn produces<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn fallback(mut self, value: Value) -> Self {
        self.fallback = Some(value);
        self
    }
}

// ---------------------------------------------------------------------------
// ExecutionRequest
// ---------------------------------------------------------------------------

/// One incoming call: the goal engine(s) plus the caller's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub request_id: Uuid,
    /// Terminal engines the caller wants.
    pub goal: Vec<String>,
    /// Opaque payload, normally a JSON object (free text, profile, dates…).
    pub raw_input: Value,
    pub user_id: String,
    /// Set when this request was derived from an earlier run by replanning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replanned_from: Option<Uuid>,
}

impl ExecutionRequest {
    pub fn new<I, S>(goal: I, raw_input: Value, user_id: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            request_id: Uuid::new_v4(),
            goal: goal.into_iter().map(Into::into).collect(),
            raw_input,
            user_id: user_id.into(),
            replanned_from: None,
        }
    }

    /// The slice of the raw input named by `reads`. Missing keys map to `null`
    /// so the fingerprint still distinguishes "absent" from "never read".
    pub fn declared_inputs(&self, reads: &BTreeSet<String>) -> Value {
        let inputs = reads
            .iter()
            .map(|key| {
                let value = self.raw_input.get(key).cloned().unwrap_or(Value::Null);
                (key.clone(), value)
            })
            .collect::<Map<_, _>>();
        Value::Object(inputs)
    }

    /// A fresh request carrying `updates` merged over this one's raw input.
    pub fn derive(&self, updates: &Map<String, Value>) -> Self {
        let mut raw_input = self.raw_input.clone();
        if let Value::Object(fields) = &mut raw_input {
            for (key, value) in updates {
                fields.insert(key.clone(), value.clone());
            }
        } else if !updates.is_empty() {
            raw_input = Value::Object(updates.clone());
        }

        Self {
            request_id: Uuid::new_v4(),
            goal: self.goal.clone(),
            raw_input,
            user_id: self.user_id.clone(),
            replanned_from: Some(self.request_id),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineResult
// ---------------------------------------------------------------------------

/// Why an engine ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A dependency failed; the engine was never invoked.
    UpstreamFailure,
    Transient,
    RateLimited,
    Permanent,
    InvalidInput,
    /// Per-attempt timeout after retries, or the run deadline.
    Timeout,
}

impl From<ErrorKind> for FailureKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Transient => Self::Transient,
            ErrorKind::RateLimited => Self::RateLimited,
            ErrorKind::Permanent => Self::Permanent,
            ErrorKind::InvalidInput => Self::InvalidInput,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::UpstreamFailure => "upstream_failure",
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Permanent => "permanent",
            Self::InvalidInput => "invalid_input",
            Self::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    /// Engine where the failure originated. For `UpstreamFailure` this is the
    /// root failing engine, not the direct dependency.
    pub engine: String,
    pub message: String,
}

/// Terminal outcome of one engine within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EngineResult {
    Success {
        value: Value,
        produced_at: DateTime<Utc>,
        from_cache: bool,
    },
    Degraded {
        value: Value,
        reason: String,
    },
    Failed {
        cause: FailureCause,
    },
}

impl EngineResult {
    pub fn success(value: Value) -> Self {
        Self::Success {
            value,
            produced_at: Utc::now(),
            from_cache: false,
        }
    }

    pub fn failed(engine: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            cause: FailureCause {
                kind,
                engine: engine.into(),
                message: message.into(),
            },
        }
    }

    /// The usable payload, if the engine produced (or fell back to) one.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success { value, .. } | Self::Degraded { value, .. } => Some(value),
            Self::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    pub fn from_cache(&self) -> bool {
        matches!(self, Self::Success { from_cache: true, .. })
    }

    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            Self::Failed { cause } => Some(cause),
            _ => None,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Success { .. } => Status::Success,
            Self::Degraded { .. } => Status::Degraded,
            Self::Failed { .. } => Status::Failed,
        }
    }
}

/// Coarse status shared by engine results and whole runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Degraded,
    Failed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeEvent
// ---------------------------------------------------------------------------

/// Signals that some upstream values changed (weather shift, safety alert,
/// profile edit). Drives replanning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub affected_input_keys: BTreeSet<String>,
    /// New raw-input values, merged into the request for the replanned run.
    #[serde(default)]
    pub updated_values: Map<String, Value>,
}

impl ChangeEvent {
    /// An event for keys whose values changed outside the request payload.
    pub fn affecting<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            affected_input_keys: keys.into_iter().map(Into::into).collect(),
            updated_values: Map::new(),
        }
    }

    /// Record a new value for `key`; the key is marked affected as well.
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        self.affected_input_keys.insert(key.clone());
        self.updated_values.insert(key, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_deserialises_with_defaults() {
        let descriptor: EngineDescriptor = serde_json::from_value(json!({
            "name": "budget",
            "depends_on": ["nlp"],
            "timeout_ms": 1500,
            "cache_ttl_secs": 60
        }))
        .expect("valid descriptor");

        assert_eq!(descriptor.name, "budget");
        assert!(descriptor.depends_on.contains("nlp"));
        assert_eq!(descriptor.timeout, Duration::from_millis(1500));
        assert_eq!(descriptor.cache_ttl, Some(Duration::from_secs(60)));
        assert_eq!(descriptor.max_retries, 0);
        assert!(!descriptor.cacheable);
        assert!(descriptor.fallback.is_none());
    }

    #[test]
    fn declared_inputs_only_exposes_read_keys() {
        let request = ExecutionRequest::new(
            ["itinerary"],
            json!({ "text": "3 days in Lisbon", "budget": 500, "secret": "x" }),
            "u-1",
        );
        let reads: BTreeSet<String> = ["text", "dates"].into_iter().map(String::from).collect();

        assert_eq!(
            request.declared_inputs(&reads),
            json!({ "text": "3 days in Lisbon", "dates": null })
        );
    }

    #[test]
    fn derived_request_merges_updates_and_links_back() {
        let request = ExecutionRequest::new(["itinerary"], json!({ "budget": 500 }), "u-1");
        let event = ChangeEvent::default().with_value("budget", json!(800));
        let derived = request.derive(&event.updated_values);

        assert_eq!(derived.raw_input["budget"], 800);
        assert_eq!(derived.replanned_from, Some(request.request_id));
        assert_ne!(derived.request_id, request.request_id);
        assert!(event.affected_input_keys.contains("budget"));
    }

    #[test]
    fn engine_result_serialises_with_status_tag() {
        let failed = EngineResult::failed("budget", FailureKind::Permanent, "no prices");
        let encoded = serde_json::to_value(&failed).unwrap();
        assert_eq!(encoded["status"], "failed");
        assert_eq!(encoded["cause"]["kind"], "permanent");
        assert_eq!(encoded["cause"]["engine"], "budget");
    }
}
