//! Sliding-window rate limiting over the shared store.
//!
//! Admission control is record-then-check: every attempt lands a timestamp
//! in the scope window (and the global window) before counting, so the
//! window state moves even on denial. Entries older than the window are
//! pruned lazily on each admission; no background sweep is needed.
//!
//! Two scopes are enforced in one pass: the specific key (usually a domain
//! or operation) and a shared `global` key. Each pass inserts exactly one
//! timestamp per window, so a request never counts itself twice.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RatePolicy;
use crate::error::StoreError;
use crate::store::KvStore;

/// Window key shared by every scope when `global_limit` is configured.
const GLOBAL_SCOPE: &str = "global";

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Denied, with the scope that was full and a back-off hint.
    Denied {
        scope: String,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Sliding-window admission control per scope key plus an optional global cap.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Check whether one more request in `scope` fits the policy window.
    ///
    /// Fails open: when the store is unreachable the request is admitted
    /// with a warning. Admission control is advisory in that degraded mode;
    /// denials only ever come from live window counts.
    pub async fn admit(&self, scope: &str, policy: &RatePolicy) -> Admission {
        if !policy.enabled {
            return Admission::Allowed;
        }
        match self.admit_inner(scope, policy).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(scope = %scope, error = %e, "rate-limit store unavailable, failing open");
                Admission::Allowed
            }
        }
    }

    async fn admit_inner(&self, scope: &str, policy: &RatePolicy) -> Result<Admission, StoreError> {
        let window = policy.window();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let min_ms = now_ms - window.as_millis() as i64;

        let scope_key = window_key(scope);
        let global_key = window_key(GLOBAL_SCOPE);

        // Record first, then prune and count — the attempt itself is part of
        // the window even if this same call ends up denied.
        self.store.window_add(&scope_key, now_ms).await?;
        self.store.window_prune(&scope_key, min_ms).await?;
        let scope_count = self.store.window_count(&scope_key).await?;
        self.store.window_expire(&scope_key, window).await?;

        let global_count = if policy.global_limit.is_none() {
            None
        } else if scope == GLOBAL_SCOPE {
            // The scope window IS the global window; a second insert would
            // make the request count itself twice.
            Some(scope_count)
        } else {
            self.store.window_add(&global_key, now_ms).await?;
            self.store.window_prune(&global_key, min_ms).await?;
            let count = self.store.window_count(&global_key).await?;
            self.store.window_expire(&global_key, window).await?;
            Some(count)
        };

        if scope_count > u64::from(policy.limit) {
            debug!(scope = %scope, count = scope_count, limit = policy.limit, "admission denied");
            return Ok(Admission::Denied {
                scope: scope.to_string(),
                retry_after: retry_after(now_ms, window),
            });
        }
        if let (Some(count), Some(limit)) = (global_count, policy.global_limit) {
            if count > u64::from(limit) {
                debug!(count, limit, "global admission denied");
                return Ok(Admission::Denied {
                    scope: GLOBAL_SCOPE.to_string(),
                    retry_after: retry_after(now_ms, window),
                });
            }
        }
        Ok(Admission::Allowed)
    }
}

fn window_key(scope: &str) -> String {
    format!("rate:{scope}")
}

/// Time to the next window slot: `window - (now mod window)`, never more
/// than the window itself.
fn retry_after(now_ms: i64, window: Duration) -> Duration {
    let window_ms = window.as_millis() as i64;
    if window_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis((window_ms - now_ms.rem_euclid(window_ms)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()))
    }

    fn policy(limit: u32, window_secs: u64) -> RatePolicy {
        RatePolicy {
            enabled: true,
            limit,
            window_secs,
            global_limit: None,
        }
    }

    #[tokio::test]
    async fn test_sixth_call_in_window_denied() {
        let limiter = limiter();
        let policy = policy(5, 60);
        for i in 0..5 {
            assert!(
                limiter.admit("api.example.com", &policy).await.is_allowed(),
                "call {} should be admitted",
                i + 1
            );
        }
        match limiter.admit("api.example.com", &policy).await {
            Admission::Denied { scope, retry_after } => {
                assert_eq!(scope, "api.example.com");
                assert!(retry_after <= Duration::from_secs(60));
            }
            Admission::Allowed => panic!("sixth call must be denied"),
        }
    }

    #[tokio::test]
    async fn test_scopes_have_independent_windows() {
        let limiter = limiter();
        let policy = policy(1, 60);
        assert!(limiter.admit("a.example.com", &policy).await.is_allowed());
        assert!(limiter.admit("b.example.com", &policy).await.is_allowed());
        assert!(!limiter.admit("a.example.com", &policy).await.is_allowed());
    }

    #[tokio::test]
    async fn test_global_cap_spans_scopes() {
        let limiter = limiter();
        let policy = RatePolicy {
            enabled: true,
            limit: 10,
            window_secs: 60,
            global_limit: Some(2),
        };
        assert!(limiter.admit("a", &policy).await.is_allowed());
        assert!(limiter.admit("b", &policy).await.is_allowed());
        match limiter.admit("c", &policy).await {
            Admission::Denied { scope, .. } => assert_eq!(scope, "global"),
            Admission::Allowed => panic!("third call must trip the global cap"),
        }
    }

    #[tokio::test]
    async fn test_global_scope_counts_once_per_request() {
        let limiter = limiter();
        let policy = RatePolicy {
            enabled: true,
            limit: 3,
            window_secs: 60,
            global_limit: Some(3),
        };
        // Admitting under the "global" scope itself must insert exactly one
        // timestamp per request, not one per window checked.
        for _ in 0..3 {
            assert!(limiter.admit("global", &policy).await.is_allowed());
        }
        let count = limiter.store.window_count("rate:global").await.unwrap();
        assert_eq!(count, 3);
        assert!(!limiter.admit("global", &policy).await.is_allowed());
    }

    #[tokio::test]
    async fn test_denied_attempt_still_recorded() {
        let limiter = limiter();
        let policy = policy(1, 60);
        assert!(limiter.admit("s", &policy).await.is_allowed());
        // Record-then-check: both denied attempts still grow the window.
        assert!(!limiter.admit("s", &policy).await.is_allowed());
        assert!(!limiter.admit("s", &policy).await.is_allowed());
        let count = limiter.store.window_count("rate:s").await.unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_disabled_policy_always_admits() {
        let limiter = limiter();
        let policy = RatePolicy {
            enabled: false,
            limit: 0,
            window_secs: 60,
            global_limit: None,
        };
        for _ in 0..10 {
            assert!(limiter.admit("s", &policy).await.is_allowed());
        }
    }

    /// Store that errors on every call, for the fail-open path.
    struct DownStore;

    #[async_trait]
    impl KvStore for DownStore {
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::new("connection refused"))
        }
        async fn set_ex(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::new("connection refused"))
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::new("connection refused"))
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::new("connection refused"))
        }
        async fn ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
            Err(StoreError::new("connection refused"))
        }
        async fn window_add(&self, _: &str, _: i64) -> Result<(), StoreError> {
            Err(StoreError::new("connection refused"))
        }
        async fn window_prune(&self, _: &str, _: i64) -> Result<(), StoreError> {
            Err(StoreError::new("connection refused"))
        }
        async fn window_count(&self, _: &str) -> Result<u64, StoreError> {
            Err(StoreError::new("connection refused"))
        }
        async fn window_expire(&self, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::new("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(DownStore));
        let policy = policy(1, 60);
        for _ in 0..5 {
            assert!(limiter.admit("s", &policy).await.is_allowed());
        }
    }

    #[test]
    fn test_retry_after_bounded_by_window() {
        let window = Duration::from_secs(60);
        for now_ms in [0i64, 1, 59_999, 60_000, 123_456] {
            let hint = retry_after(now_ms, window);
            assert!(hint <= window, "retry_after must never exceed the window");
            assert!(hint > Duration::ZERO);
        }
    }
}
