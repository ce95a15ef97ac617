//! Per-operation circuit breaker.
//!
//! Tracks consecutive terminal failures per operation name and fails fast
//! while a dependency is unhealthy: `Closed → (failures ≥ threshold) →
//! Open → (reset timeout elapses) → trial call → success → Closed /
//! failure → Open (timer renewed)`.
//!
//! Failure accounting is terminal-outcome-only: one exhausted retry
//! sequence counts as one failure, individual attempts within it do not.
//! A single noisy call can therefore never open the circuit by itself.
//!
//! State is process-local and lives for the life of the process; an entry
//! is created lazily on an operation's first failure and reset by any
//! success.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitPolicy;
use crate::error::InvokeError;

#[derive(Debug, Clone)]
struct BreakerState {
    failure_count: u32,
    last_failure_at: Option<Instant>,
    opened_until: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            failure_count: 0,
            last_failure_at: None,
            opened_until: None,
        }
    }
}

/// Failure-tracking state machine keyed by operation name.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct CircuitBreaker {
    states: Arc<DashMap<String, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject immediately while the circuit is open and the cooldown has
    /// not elapsed. Past the deadline the call proceeds as a trial.
    pub fn allow(&self, operation: &str) -> Result<(), InvokeError> {
        let Some(state) = self.states.get(operation) else {
            // No failures recorded yet.
            return Ok(());
        };
        if let Some(until) = state.opened_until {
            let now = Instant::now();
            if now < until {
                return Err(InvokeError::CircuitOpen {
                    operation: operation.to_string(),
                    retry_after: until.duration_since(now),
                });
            }
            debug!(operation = %operation, "circuit cooldown elapsed, allowing trial call");
        }
        Ok(())
    }

    /// Any success closes the circuit and zeroes the failure count.
    pub fn record_success(&self, operation: &str) {
        if let Some(mut state) = self.states.get_mut(operation) {
            if state.opened_until.is_some() {
                info!(operation = %operation, "circuit closed after successful trial");
            }
            *state = BreakerState::new();
        }
    }

    /// Record one terminal failure; opens the circuit at the threshold and
    /// renews the cooldown on a failed trial.
    pub fn record_failure(&self, operation: &str, policy: &CircuitPolicy) {
        let mut state = self
            .states
            .entry(operation.to_string())
            .or_insert_with(BreakerState::new);
        state.failure_count += 1;
        state.last_failure_at = Some(Instant::now());
        if state.failure_count >= policy.failure_threshold {
            let was_open = state.opened_until.is_some();
            state.opened_until = Some(Instant::now() + policy.reset_timeout());
            if was_open {
                debug!(operation = %operation, "trial call failed, circuit cooldown renewed");
            } else {
                warn!(
                    operation = %operation,
                    failures = state.failure_count,
                    reset_secs = policy.reset_secs,
                    "circuit opened"
                );
            }
        }
    }

    /// Whether the circuit for `operation` is currently open (diagnostic).
    pub fn is_open(&self, operation: &str) -> bool {
        self.states
            .get(operation)
            .and_then(|s| s.opened_until)
            .is_some_and(|until| Instant::now() < until)
    }

    /// Consecutive terminal failures recorded for `operation` (diagnostic).
    pub fn failure_count(&self, operation: &str) -> u32 {
        self.states
            .get(operation)
            .map(|s| s.failure_count)
            .unwrap_or(0)
    }
}
