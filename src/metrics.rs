//! Metrics sink for the invocation layer.
//!
//! The invoker emits a counter event at every decision point and one
//! latency observation per invocation, keyed by `{operation, outcome}`.
//! Events are a closed enum rather than free-form strings, so a sink can
//! match exhaustively and a typo cannot mint a new metric series.
//!
//! The crate ships [`NoopMetrics`] (default) and [`RecordingMetrics`] (an
//! in-memory sink for tests and diagnostics); exporting to a real backend
//! is the host application's concern.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Counter events emitted while an invocation moves through the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricEvent {
    CacheHit,
    CacheMiss,
    RateAdmitted,
    RateDenied,
    CircuitRejected,
    FlightLeader,
    FlightFollower,
    FlightLeaderTimeout,
    UpstreamSuccess,
    UpstreamFailure,
}

impl MetricEvent {
    /// Stable label for export pipelines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::RateAdmitted => "rate_admitted",
            Self::RateDenied => "rate_denied",
            Self::CircuitRejected => "circuit_rejected",
            Self::FlightLeader => "flight_leader",
            Self::FlightFollower => "flight_follower",
            Self::FlightLeaderTimeout => "flight_leader_timeout",
            Self::UpstreamSuccess => "upstream_success",
            Self::UpstreamFailure => "upstream_failure",
        }
    }
}

/// Terminal outcome of one invocation, for latency histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeOutcome {
    Success,
    CacheHit,
    RateLimited,
    CircuitOpen,
    UpstreamError,
}

impl InvokeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::CacheHit => "cache_hit",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::UpstreamError => "upstream_error",
        }
    }
}

/// Destination for counters and latency observations.
pub trait MetricsSink: Send + Sync {
    /// Increment the counter for `event` under `operation`.
    fn incr(&self, operation: &str, event: MetricEvent);

    /// Observe one invocation's wall-clock latency.
    fn observe_latency(&self, operation: &str, outcome: InvokeOutcome, latency: Duration);
}

/// Discards everything. The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _operation: &str, _event: MetricEvent) {}
    fn observe_latency(&self, _operation: &str, _outcome: InvokeOutcome, _latency: Duration) {}
}

/// In-memory sink that keeps raw counts and observations, for tests.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    counters: Mutex<HashMap<(String, MetricEvent), u64>>,
    latencies: Mutex<Vec<(String, InvokeOutcome, Duration)>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for `(operation, event)`.
    pub fn count(&self, operation: &str, event: MetricEvent) -> u64 {
        self.counters
            .lock()
            .expect("metrics counter lock poisoned")
            .get(&(operation.to_string(), event))
            .copied()
            .unwrap_or(0)
    }

    /// All recorded latency observations.
    pub fn latencies(&self) -> Vec<(String, InvokeOutcome, Duration)> {
        self.latencies
            .lock()
            .expect("metrics latency lock poisoned")
            .clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn incr(&self, operation: &str, event: MetricEvent) {
        *self
            .counters
            .lock()
            .expect("metrics counter lock poisoned")
            .entry((operation.to_string(), event))
            .or_insert(0) += 1;
    }

    fn observe_latency(&self, operation: &str, outcome: InvokeOutcome, latency: Duration) {
        self.latencies
            .lock()
            .expect("metrics latency lock poisoned")
            .push((operation.to_string(), outcome, latency));
    }
}
