//! Engine-level error type.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by an engine's `invoke` method.
///
/// The executor uses the variant to decide retry behaviour:
/// - `Transient` / `RateLimited`: retried with exponential back-off.
/// - `Permanent` / `InvalidInput`: the engine fails immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Temporary failure (network blip, 5xx from the model provider).
    #[error("transient engine error: {0}")]
    Transient(String),

    /// The provider throttled us. `retry_after` is the provider's hint, if any.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Failure that will not go away by retrying.
    #[error("permanent engine error: {0}")]
    Permanent(String),

    /// The caller supplied something the engine cannot work with.
    #[error("invalid engine input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    /// Whether the executor should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// Provider-indicated delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Human-readable detail without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) | Self::InvalidInput(msg) => msg,
            Self::RateLimited { message, .. } => message,
        }
    }
}

/// Wire-level classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    RateLimited,
    Permanent,
    InvalidInput,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_rate_limited_are_retryable() {
        assert!(EngineError::Transient("x".into()).is_retryable());
        assert!(EngineError::RateLimited { message: "x".into(), retry_after: None }.is_retryable());
        assert!(!EngineError::Permanent("x".into()).is_retryable());
        assert!(!EngineError::InvalidInput("x".into()).is_retryable());
    }

    #[test]
    fn retry_after_is_only_reported_for_rate_limits() {
        let limited = EngineError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(limited.message(), "slow down");
        assert_eq!(EngineError::Transient("x".into()).retry_after(), None);
    }
}
