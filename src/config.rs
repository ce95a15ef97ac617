//! Per-operation invocation policies.
//!
//! One [`InvokePolicy`] bundles the cache, rate-limit, retry, circuit, and
//! single-flight parameters for a call site. Policies deserialize from
//! config files with sensible defaults, so an empty `{}` section yields a
//! working policy. Durations are expressed in whole seconds in config and
//! exposed as [`Duration`] accessors.

use serde::Deserialize;
use std::time::Duration;

/// Full policy bundle for one operation / call site.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct InvokePolicy {
    pub cache: CachePolicy,
    pub rate: RatePolicy,
    pub retry: RetryPolicy,
    pub circuit: CircuitPolicy,
    pub flight: FlightPolicy,
}

/// Response-cache parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CachePolicy {
    /// When false, the cache and the single-flight gate are both bypassed.
    pub enabled: bool,
    /// Entry lifetime in seconds.
    pub ttl_secs: u64,
    /// Minimum remaining TTL for a hit to be trusted. Entries closer to
    /// expiry than this are treated as misses so they cannot expire mid-use.
    pub min_fresh_secs: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            min_fresh_secs: 60,
        }
    }
}

impl CachePolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn min_fresh(&self) -> Duration {
        Duration::from_secs(self.min_fresh_secs)
    }
}

/// Sliding-window rate-limit parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RatePolicy {
    /// When false, admission is always granted.
    pub enabled: bool,
    /// Maximum requests per scope key within the window.
    pub limit: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Optional cap across all scopes sharing the limiter. `None` disables
    /// the global check.
    pub global_limit: Option<u32>,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 100,
            window_secs: 60,
            global_limit: None,
        }
    }
}

impl RatePolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Bounded-retry parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Must be at least 1.
    pub max_attempts: u32,
    /// Base delay in seconds; the k-th failed attempt waits `base * 2^k`.
    pub base_delay_secs: f64,
    /// Upper bound on any single backoff delay, in seconds.
    pub max_delay_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 30.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after the `attempt`-th failure (0-indexed), capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.base_delay_secs * 2f64.powi(attempt as i32);
        Duration::from_secs_f64(secs.min(self.max_delay_secs).max(0.0))
    }
}

/// Circuit-breaker parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitPolicy {
    /// Consecutive terminal failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cooldown in seconds before a trial call is allowed.
    pub reset_secs: u64,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_secs: 60,
        }
    }
}

impl CircuitPolicy {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_secs)
    }
}

/// Single-flight gate parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlightPolicy {
    /// How long a follower waits for the leader before proceeding on its
    /// own. Converts a stuck leader into at most one duplicate call.
    pub leader_timeout_secs: u64,
}

impl Default for FlightPolicy {
    fn default() -> Self {
        Self {
            leader_timeout_secs: 30,
        }
    }
}

impl FlightPolicy {
    pub fn leader_timeout(&self) -> Duration {
        Duration::from_secs(self.leader_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_section_yields_defaults() {
        let policy: InvokePolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, InvokePolicy::default());
        assert_eq!(policy.retry.max_attempts, 3);
        assert_eq!(policy.circuit.failure_threshold, 5);
        assert_eq!(policy.cache.ttl_secs, 3600);
        assert_eq!(policy.rate.limit, 100);
    }

    #[test]
    fn test_partial_override() {
        let policy: InvokePolicy = serde_json::from_str(
            r#"{"rate": {"limit": 5, "window_secs": 60}, "retry": {"max_attempts": 2}}"#,
        )
        .unwrap();
        assert_eq!(policy.rate.limit, 5);
        assert_eq!(policy.retry.max_attempts, 2);
        // Untouched sections keep their defaults.
        assert_eq!(policy.cache.min_fresh_secs, 60);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 6,
            base_delay_secs: 1.0,
            max_delay_secs: 4.0,
        };
        assert_eq!(retry.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(4));
        // Capped past the max.
        assert_eq!(retry.delay_for_attempt(5), Duration::from_secs(4));
    }
}
