//! Shared key-value store abstraction.
//!
//! `KvStore` abstracts the scalar and timestamp-window operations the
//! invocation layer needs, so the cache and rate limiter can sit on Redis
//! in production and on [`MemoryStore`] in tests and single-process
//! deployments. The window operations map one-to-one onto Redis sorted-set
//! primitives (`ZADD` / `ZREMRANGEBYSCORE` / `ZCARD` / `EXPIRE`).
//!
//! All mutations are atomic per key; the layer above never needs a
//! cross-process lock for scalar or window state.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::StoreError;

/// Scalar get/set-with-expiry plus ordered per-key timestamp windows.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a scalar value. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a scalar value with a TTL (Redis `SETEX`).
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a scalar value. Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Whether a live (unexpired) scalar value exists for `key`.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Remaining TTL for `key`, or `None` when the key is absent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Append a timestamp (epoch milliseconds) to the window at `key`.
    async fn window_add(&self, key: &str, timestamp_ms: i64) -> Result<(), StoreError>;

    /// Drop window entries strictly older than `min_timestamp_ms`.
    async fn window_prune(&self, key: &str, min_timestamp_ms: i64) -> Result<(), StoreError>;

    /// Count entries currently in the window at `key`.
    async fn window_count(&self, key: &str) -> Result<u64, StoreError>;

    /// Set the window's own expiry so idle keys vanish from the store.
    async fn window_expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct ScalarEntry {
    value: String,
    expires_at: Instant,
}

impl ScalarEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug, Default, Clone)]
struct WindowEntry {
    /// Ascending epoch-millisecond timestamps.
    timestamps: Vec<i64>,
    expires_at: Option<Instant>,
}

impl WindowEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process [`KvStore`] backed by `DashMap`, with lazy expiry.
///
/// Deadlines use `tokio::time::Instant`, so TTL behavior is fully
/// controllable from `#[tokio::test(start_paused = true)]` tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    scalars: DashMap<String, ScalarEntry>,
    windows: DashMap<String, WindowEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.scalars.get(key) {
            Some(entry) if !entry.is_expired() => Ok(Some(entry.value.clone())),
            Some(entry) => {
                drop(entry);
                self.scalars.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.scalars.insert(
            key.to_string(),
            ScalarEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.scalars.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        match self.scalars.get(key) {
            Some(entry) if !entry.is_expired() => {
                Ok(Some(entry.expires_at.duration_since(Instant::now())))
            }
            Some(entry) => {
                drop(entry);
                self.scalars.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn window_add(&self, key: &str, timestamp_ms: i64) -> Result<(), StoreError> {
        let mut entry = self.windows.entry(key.to_string()).or_default();
        if entry.is_expired() {
            entry.timestamps.clear();
            entry.expires_at = None;
        }
        // Timestamps arrive in near-order; keep the vec sorted for pruning.
        match entry.timestamps.binary_search(&timestamp_ms) {
            Ok(pos) | Err(pos) => entry.timestamps.insert(pos, timestamp_ms),
        }
        Ok(())
    }

    async fn window_prune(&self, key: &str, min_timestamp_ms: i64) -> Result<(), StoreError> {
        if let Some(mut entry) = self.windows.get_mut(key) {
            if entry.is_expired() {
                entry.timestamps.clear();
            } else {
                entry.timestamps.retain(|&ts| ts >= min_timestamp_ms);
            }
        }
        Ok(())
    }

    async fn window_count(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self
            .windows
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.timestamps.len() as u64)
            .unwrap_or(0))
    }

    async fn window_expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(mut entry) = self.windows.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}
