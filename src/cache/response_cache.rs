//! Remote-call response cache with TTL over a shared key-value store.
//!
//! Keys are canonical SHA-256 digests of `(operation, normalized params)`
//! under a `namespace:version:` prefix, so the same logical request always
//! maps to the same entry across processes. A hit is returned only when the
//! payload deserializes into the expected shape and enough TTL remains;
//! corrupt payloads and store failures downgrade to a miss — the cache is
//! advisory, never authoritative.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::store::KvStore;

/// Bump when the cached payload encoding changes; old entries become
/// invisible instead of corrupt.
const KEY_VERSION: &str = "v1";

/// Result of a cache lookup. A dedicated type rather than `Option` so that
/// cache misses can never be confused with upstream failures at call sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup<T> {
    /// A live, structurally valid entry.
    Hit(T),
    /// Absent, expired, too close to expiry, or unreadable.
    Miss,
}

impl<T> CacheLookup<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Hit(value) => Some(value),
            Self::Miss => None,
        }
    }
}

/// TTL cache for serialized remote-call responses.
///
/// Cheap to clone; clones share the underlying store handle.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    namespace: String,
}

impl ResponseCache {
    /// Create a cache over `store`, scoped to `namespace`.
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Build a deterministic cache key: SHA-256 of operation + normalized
    /// parameters.
    ///
    /// Uses length-prefixed encoding to prevent separator collisions, and
    /// `serde_json::Value`'s canonical rendering so semantically equal
    /// parameter maps hash identically regardless of construction order.
    pub fn canonical_key(operation: &str, params: &serde_json::Value) -> String {
        let normalized = params.to_string();
        let mut hasher = Sha256::new();
        hasher.update((operation.len() as u64).to_le_bytes());
        hasher.update(operation.as_bytes());
        hasher.update((normalized.len() as u64).to_le_bytes());
        hasher.update(normalized.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up an entry. Deserialization failure is treated as a miss and
    /// the bad entry is removed best-effort so followers stop re-hitting it.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheLookup<T> {
        let full_key = self.full_key(key);
        let raw = match self.store.get(&full_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return CacheLookup::Miss,
            Err(e) => {
                warn!(key = %short(key), error = %e, "cache read failed, treating as miss");
                return CacheLookup::Miss;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => CacheLookup::Hit(value),
            Err(e) => {
                warn!(key = %short(key), error = %e, "corrupt cache payload, dropping entry");
                let _ = self.store.delete(&full_key).await;
                CacheLookup::Miss
            }
        }
    }

    /// Like [`Self::get`], but also requires at least `min_remaining` TTL so
    /// a hit cannot expire mid-use.
    pub async fn get_fresh<T: DeserializeOwned>(
        &self,
        key: &str,
        min_remaining: Duration,
    ) -> CacheLookup<T> {
        if !min_remaining.is_zero() {
            match self.store.ttl(&self.full_key(key)).await {
                Ok(Some(remaining)) if remaining <= min_remaining => {
                    debug!(
                        key = %short(key),
                        remaining_secs = remaining.as_secs(),
                        "cache entry too close to expiry, treating as miss"
                    );
                    return CacheLookup::Miss;
                }
                Ok(Some(_)) => {}
                Ok(None) => return CacheLookup::Miss,
                Err(e) => {
                    warn!(key = %short(key), error = %e, "cache ttl probe failed, treating as miss");
                    return CacheLookup::Miss;
                }
            }
        }
        self.get(key).await
    }

    /// Store a value with a TTL. Best-effort: serialization or store errors
    /// are logged and swallowed, returning `false`.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %short(key), error = %e, "failed to serialize cache payload");
                return false;
            }
        };
        match self.store.set_ex(&self.full_key(key), &raw, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %short(key), error = %e, "cache write failed");
                false
            }
        }
    }

    /// Explicitly invalidate an entry. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> bool {
        match self.store.delete(&self.full_key(key)).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(key = %short(key), error = %e, "cache delete failed");
                false
            }
        }
    }

    /// Whether a live entry exists without reading its payload.
    pub async fn exists(&self, key: &str) -> bool {
        match self.store.exists(&self.full_key(key)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key = %short(key), error = %e, "cache exists probe failed");
                false
            }
        }
    }

    /// Remaining TTL for an entry, `None` when absent or unreadable.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        match self.store.ttl(&self.full_key(key)).await {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!(key = %short(key), error = %e, "cache ttl probe failed");
                None
            }
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}:{}", self.namespace, KEY_VERSION, key)
    }
}

/// Truncated key for log lines; full digests are noise. Cuts on a char
/// boundary so arbitrary caller keys cannot panic a log path.
fn short(key: &str) -> &str {
    key.char_indices().nth(8).map_or(key, |(i, _)| &key[..i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Completion {
        content: String,
        finish_reason: String,
    }

    fn test_cache() -> (Arc<MemoryStore>, ResponseCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::new(store.clone(), "llm");
        (store, cache)
    }

    fn completion(content: &str) -> Completion {
        Completion {
            content: content.into(),
            finish_reason: "stop".into(),
        }
    }

    #[test]
    fn test_canonical_key_deterministic() {
        let a = ResponseCache::canonical_key("generate", &json!({"model": "m", "prompt": "p"}));
        let b = ResponseCache::canonical_key("generate", &json!({"model": "m", "prompt": "p"}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonical_key_operation_and_param_aware() {
        let base = ResponseCache::canonical_key("generate", &json!({"prompt": "p"}));
        assert_ne!(
            base,
            ResponseCache::canonical_key("embed", &json!({"prompt": "p"}))
        );
        assert_ne!(
            base,
            ResponseCache::canonical_key("generate", &json!({"prompt": "q"}))
        );
    }

    #[test]
    fn test_canonical_key_no_separator_collision() {
        // Operation "a|b" with params "c" must differ from "a" with "b|c".
        let a = ResponseCache::canonical_key("a|b", &json!("c"));
        let b = ResponseCache::canonical_key("a", &json!("b|c"));
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_and_miss() {
        let (_, cache) = test_cache();
        assert_eq!(cache.get::<Completion>("k").await, CacheLookup::Miss);
        assert!(
            cache
                .set("k", &completion("hi"), Duration::from_secs(60))
                .await
        );
        assert_eq!(
            cache.get::<Completion>("k").await,
            CacheLookup::Hit(completion("hi"))
        );
        assert!(cache.exists("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let (_, cache) = test_cache();
        cache
            .set("k", &completion("v"), Duration::from_secs(2))
            .await;
        assert!(cache.get::<Completion>("k").await.is_hit());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(cache.get::<Completion>("k").await, CacheLookup::Miss);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_payload_downgrades_to_miss() {
        let (store, cache) = test_cache();
        store
            .set_ex("llm:v1:k", "{not json", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get::<Completion>("k").await, CacheLookup::Miss);
        // The bad entry is dropped so the next read is a clean miss.
        assert!(!cache.exists("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_payload_under_multibyte_key() {
        // Subscriber installed so the warn path evaluates its key field.
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .try_init();
        let (store, cache) = test_cache();
        store
            .set_ex("llm:v1:aaaaaaaéx", "{not json", Duration::from_secs(60))
            .await
            .unwrap();
        // Byte 8 falls inside 'é'; logging the miss must not panic.
        assert_eq!(
            cache.get::<Completion>("aaaaaaaéx").await,
            CacheLookup::Miss
        );
    }

    #[test]
    fn test_short_key_cuts_on_char_boundary() {
        assert_eq!(short("abcdefghij"), "abcdefgh");
        assert_eq!(short("ab"), "ab");
        assert_eq!(short("aaaaaaaéx"), "aaaaaaaé");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_shape_downgrades_to_miss() {
        let (store, cache) = test_cache();
        // Valid JSON, wrong structure for Completion.
        store
            .set_ex("llm:v1:k", r#"{"unexpected": 1}"#, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get::<Completion>("k").await, CacheLookup::Miss);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_floor_rejects_near_expiry() {
        let (_, cache) = test_cache();
        cache
            .set("k", &completion("v"), Duration::from_secs(30))
            .await;
        // 30s remaining is under a 60s floor.
        assert_eq!(
            cache
                .get_fresh::<Completion>("k", Duration::from_secs(60))
                .await,
            CacheLookup::Miss
        );
        // But a plain get still hits.
        assert!(cache.get::<Completion>("k").await.is_hit());
        // And a lower floor accepts it.
        assert!(
            cache
                .get_fresh::<Completion>("k", Duration::from_secs(10))
                .await
                .is_hit()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_ttl() {
        let (_, cache) = test_cache();
        cache
            .set("k", &completion("v"), Duration::from_secs(120))
            .await;
        let remaining = cache.ttl("k").await.unwrap();
        assert!(remaining <= Duration::from_secs(120));
        assert!(cache.delete("k").await);
        assert!(!cache.delete("k").await);
        assert_eq!(cache.ttl("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_namespaces_are_isolated() {
        let store = Arc::new(MemoryStore::new());
        let llm = ResponseCache::new(store.clone(), "llm");
        let crawl = ResponseCache::new(store, "crawl");
        llm.set("k", &completion("v"), Duration::from_secs(60)).await;
        assert_eq!(crawl.get::<Completion>("k").await, CacheLookup::Miss);
    }
}
