//! Error taxonomy for the invocation layer.
//!
//! Only three conditions cross the façade boundary: admission denial,
//! circuit-open fail-fast, and upstream failure after retry exhaustion.
//! Everything cache- or lock-related is absorbed internally and logged;
//! a flaky store must never masquerade as a failing dependency.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, InvokeError>;

/// Errors surfaced to callers of [`crate::invoker::ResilientInvoker`].
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The sliding-window rate limiter denied admission. The caller should
    /// back off for at least `retry_after` before trying again.
    #[error("rate limit exceeded for '{scope}', retry after {}s", retry_after.as_secs())]
    RateLimitExceeded {
        /// The scope whose window was full (a domain, an operation, or `global`).
        scope: String,
        /// Time until the next window slot opens.
        retry_after: Duration,
    },

    /// The circuit breaker for this operation is open; the dependency was
    /// not attempted.
    #[error("circuit open for '{operation}', retry after {}s", retry_after.as_secs())]
    CircuitOpen {
        /// Operation name the breaker is keyed on.
        operation: String,
        /// Time until a trial call will be allowed.
        retry_after: Duration,
    },

    /// The upstream call failed after all retry attempts were exhausted.
    /// `attempts` marks that retries were performed; `source` carries the
    /// original error's classification.
    #[error("upstream call failed after {attempts} attempt(s): {source}")]
    Upstream {
        /// Number of attempts actually made.
        attempts: u32,
        /// The last error returned by the invoked function.
        #[source]
        source: anyhow::Error,
    },
}

impl InvokeError {
    /// Retry hint for "try later" conditions, `None` for upstream failures.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. }
            | Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Self::Upstream { .. } => None,
        }
    }
}

/// Internal error for shared-store operations.
///
/// Never surfaced across the façade: the cache downgrades store failures to
/// a miss, the rate limiter fails open. Store implementations map their
/// transport errors into this type.
#[derive(Debug, thiserror::Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
