//! steadycall — resilient invocation of costly remote dependencies.
//!
//! Wraps calls to unreliable, rate-limited upstreams (LLM completion
//! endpoints, third-party REST APIs, crawl targets) in one decision layer:
//!
//! - **[`limiter::RateLimiter`]** — sliding-window admission per scope plus
//!   an optional global cap, over a shared store.
//! - **[`cache::ResponseCache`]** — TTL response cache with canonical keys
//!   and a freshness floor; corruption downgrades to a miss.
//! - **[`flight::SingleFlightGate`]** — at most one concurrent computation
//!   per key; followers reuse the leader's committed result.
//! - **[`breaker::CircuitBreaker`]** — per-operation fail-fast after
//!   consecutive terminal failures.
//! - **[`retry`]** — bounded attempts with exponential backoff.
//! - **[`invoker::ResilientInvoker`]** — the façade composing all of the
//!   above, used uniformly by every call site.
//!
//! ```no_run
//! use std::sync::Arc;
//! use steadycall::{CallContext, InvokePolicy, MemoryStore, ResilientInvoker};
//!
//! # async fn demo() -> Result<(), steadycall::InvokeError> {
//! let invoker = ResilientInvoker::new(Arc::new(MemoryStore::new()));
//! let ctx = CallContext::new(
//!     "llm.generate",
//!     &serde_json::json!({"model": "m1", "prompt": "hello"}),
//! );
//! let policy = InvokePolicy::default();
//!
//! let completion: String = invoker
//!     .invoke(&ctx, &policy, || async {
//!         // the actual remote call lives here
//!         Ok("generated text".to_string())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! The invoked function must be idempotent-safe-to-retry. Only three error
//! conditions ever cross the façade: [`InvokeError::RateLimitExceeded`],
//! [`InvokeError::CircuitOpen`], and [`InvokeError::Upstream`].

pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod flight;
pub mod invoker;
pub mod limiter;
pub mod metrics;
pub mod retry;
pub mod store;

pub use breaker::CircuitBreaker;
pub use cache::{CacheLookup, ResponseCache};
pub use config::{CachePolicy, CircuitPolicy, FlightPolicy, InvokePolicy, RatePolicy, RetryPolicy};
pub use error::{InvokeError, Result, StoreError};
pub use flight::{FlightRole, SingleFlightGate};
pub use invoker::{CallContext, ResilientInvoker};
pub use limiter::{Admission, RateLimiter};
pub use metrics::{InvokeOutcome, MetricEvent, MetricsSink, NoopMetrics, RecordingMetrics};
pub use store::{KvStore, MemoryStore};
