//! The façade composing rate limiting, caching, single-flight, circuit
//! breaking, and retry around an arbitrary remote call.
//!
//! One `ResilientInvoker` instance serves every call site (LLM client,
//! external-API client, crawl fetcher), each passing its own
//! [`InvokePolicy`]; the decision flow is identical everywhere so policies
//! cannot drift per call site.
//!
//! Flow per invocation: admit → fresh cache probe (hit short-circuits) →
//! enter gate → follower re-checks cache → breaker gate → bounded retry →
//! commit to cache and record the terminal outcome → release the gate.
//!
//! The leader's computation runs in a spawned task: cancelling the caller
//! abandons the wait but not the work, so the cache still gets populated
//! for later callers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::cache::{CacheLookup, ResponseCache};
use crate::config::InvokePolicy;
use crate::error::{InvokeError, Result};
use crate::flight::{FlightRole, SingleFlightGate};
use crate::limiter::{Admission, RateLimiter};
use crate::metrics::{InvokeOutcome, MetricEvent, MetricsSink, NoopMetrics};
use crate::retry;
use crate::store::KvStore;

/// Identifies one logical call: the operation (breaker and metrics key),
/// the canonical cache key, and the rate-limit scope.
#[derive(Debug, Clone)]
pub struct CallContext {
    operation: String,
    cache_key: String,
    rate_key: String,
}

impl CallContext {
    /// Derive the cache key from the operation name and its normalized
    /// parameters. The rate scope defaults to the operation name.
    pub fn new(operation: impl Into<String>, params: &serde_json::Value) -> Self {
        let operation = operation.into();
        let cache_key = ResponseCache::canonical_key(&operation, params);
        Self {
            rate_key: operation.clone(),
            operation,
            cache_key,
        }
    }

    /// Rate-limit under a coarser scope than the operation, e.g. the target
    /// domain for a crawl fetch.
    pub fn with_rate_key(mut self, scope: impl Into<String>) -> Self {
        self.rate_key = scope.into();
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn rate_key(&self) -> &str {
        &self.rate_key
    }
}

/// Resilient invocation façade.
///
/// Construct one per process (or per shared store) at startup and hand it
/// to every consumer; all state lives in explicit instances, never in
/// globals.
pub struct ResilientInvoker {
    cache: ResponseCache,
    limiter: RateLimiter,
    gate: SingleFlightGate,
    breaker: CircuitBreaker,
    metrics: Arc<dyn MetricsSink>,
}

impl ResilientInvoker {
    /// Build an invoker over `store` with no metrics export.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_metrics(store, Arc::new(NoopMetrics))
    }

    /// Build an invoker over `store`, emitting to `metrics`.
    pub fn with_metrics(store: Arc<dyn KvStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            cache: ResponseCache::new(store.clone(), "invoke"),
            limiter: RateLimiter::new(store),
            gate: SingleFlightGate::new(),
            breaker: CircuitBreaker::new(),
            metrics,
        }
    }

    /// Direct access to the response cache, for explicit invalidation.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Call `f` under the policy's rate-limit, cache, single-flight,
    /// circuit-breaker, and retry rules.
    ///
    /// `f` must be idempotent-safe-to-retry: it may run more than once per
    /// invocation (retries) and, in bounded corner cases, more than once
    /// across concurrent invocations (a fallback leader after a stuck
    /// leader, or two processes racing on a shared store).
    ///
    /// Only [`InvokeError::RateLimitExceeded`], [`InvokeError::CircuitOpen`],
    /// and [`InvokeError::Upstream`] are ever returned; cache and store
    /// trouble is absorbed and logged.
    pub async fn invoke<T, F, Fut>(&self, ctx: &CallContext, policy: &InvokePolicy, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let started = Instant::now();
        let op = ctx.operation.as_str();

        // Admission control first: a denied request must not touch the
        // cache or the gate.
        match self.limiter.admit(&ctx.rate_key, &policy.rate).await {
            Admission::Allowed => self.metrics.incr(op, MetricEvent::RateAdmitted),
            Admission::Denied { scope, retry_after } => {
                self.metrics.incr(op, MetricEvent::RateDenied);
                self.metrics
                    .observe_latency(op, InvokeOutcome::RateLimited, started.elapsed());
                return Err(InvokeError::RateLimitExceeded { scope, retry_after });
            }
        }

        let cache_enabled = policy.cache.enabled;
        if cache_enabled {
            if let CacheLookup::Hit(value) = self
                .cache
                .get_fresh::<T>(&ctx.cache_key, policy.cache.min_fresh())
                .await
            {
                self.metrics.incr(op, MetricEvent::CacheHit);
                self.metrics
                    .observe_latency(op, InvokeOutcome::CacheHit, started.elapsed());
                return Ok(value);
            }
            self.metrics.incr(op, MetricEvent::CacheMiss);
        }

        // Without a cache there is no commit point for a follower to
        // re-check, so the gate would only serialize independent calls.
        let guard = if cache_enabled {
            let guard = self
                .gate
                .enter(&ctx.cache_key, policy.flight.leader_timeout())
                .await;
            match guard.role() {
                FlightRole::Leader => self.metrics.incr(op, MetricEvent::FlightLeader),
                FlightRole::FallbackLeader => {
                    self.metrics.incr(op, MetricEvent::FlightLeaderTimeout)
                }
                FlightRole::Follower => {
                    self.metrics.incr(op, MetricEvent::FlightFollower);
                    // The leader committed before releasing; this hits
                    // unless the leader failed or its entry already aged out.
                    if let CacheLookup::Hit(value) = self
                        .cache
                        .get_fresh::<T>(&ctx.cache_key, policy.cache.min_fresh())
                        .await
                    {
                        self.metrics.incr(op, MetricEvent::CacheHit);
                        self.metrics
                            .observe_latency(op, InvokeOutcome::CacheHit, started.elapsed());
                        return Ok(value);
                    }
                    debug!(operation = %op, "follower found no committed result, computing");
                }
            }
            Some(guard)
        } else {
            None
        };

        if let Err(e) = self.breaker.allow(op) {
            self.metrics.incr(op, MetricEvent::CircuitRejected);
            self.metrics
                .observe_latency(op, InvokeOutcome::CircuitOpen, started.elapsed());
            return Err(e);
        }

        // Leader work runs detached: a cancelled consumer stops waiting,
        // the producer still finishes and commits for later callers.
        let cache = self.cache.clone();
        let breaker = self.breaker.clone();
        let metrics = self.metrics.clone();
        let operation = ctx.operation.clone();
        let cache_key = ctx.cache_key.clone();
        let retry_policy = policy.retry.clone();
        let circuit_policy = policy.circuit.clone();
        let cache_ttl = policy.cache.ttl();

        let handle = tokio::spawn(async move {
            let outcome = match retry::run(&retry_policy, f).await {
                Ok((value, attempts)) => {
                    breaker.record_success(&operation);
                    metrics.incr(&operation, MetricEvent::UpstreamSuccess);
                    if cache_enabled {
                        cache.set(&cache_key, &value, cache_ttl).await;
                    }
                    debug!(operation = %operation, attempts, "upstream call succeeded");
                    Ok(value)
                }
                Err(e) => {
                    // Terminal-outcome-only accounting: the whole exhausted
                    // sequence is one breaker failure.
                    breaker.record_failure(&operation, &circuit_policy);
                    metrics.incr(&operation, MetricEvent::UpstreamFailure);
                    Err(InvokeError::Upstream {
                        attempts: e.attempts,
                        source: e.source,
                    })
                }
            };
            // The commit above happens before the gate releases; followers
            // waiting on this key re-check the cache next.
            drop(guard);
            outcome
        });

        match handle.await {
            Ok(Ok(value)) => {
                self.metrics
                    .observe_latency(op, InvokeOutcome::Success, started.elapsed());
                Ok(value)
            }
            Ok(Err(e)) => {
                self.metrics
                    .observe_latency(op, InvokeOutcome::UpstreamError, started.elapsed());
                Err(e)
            }
            Err(join_error) => {
                // The invoked function panicked; surface it as an upstream
                // failure rather than poisoning the caller.
                self.metrics
                    .observe_latency(op, InvokeOutcome::UpstreamError, started.elapsed());
                Err(InvokeError::Upstream {
                    attempts: 0,
                    source: anyhow::Error::new(join_error),
                })
            }
        }
    }
}
