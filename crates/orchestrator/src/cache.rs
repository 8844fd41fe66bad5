//! Fingerprint cache: memoised engine outputs keyed by resolved inputs.
//!
//! Only `Success` results are stored. Entries carry the engine name and the
//! canonical inputs they were computed from so that invalidation can match
//! on input values (e.g. drop everything derived from one user's profile).
//!
//! Correctness assumes engines are pure functions of their resolved inputs.
//! An engine that reads the outside world should either be non-cacheable or
//! be refreshed through a change event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::fingerprint::{engine_prefix, CacheKey, KEY_PREFIX};
use crate::store::CacheStore;
use crate::{CacheError, EngineDescriptor, EngineResult};

/// What is persisted in the backing store for one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub engine: String,
    pub inputs: Value,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Shared across concurrent runs; cloning is cheap and shares the store and
/// counters.
#[derive(Clone)]
pub struct FingerprintCache {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl FingerprintCache {
    pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            config: config.clone(),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The TTL this engine's entries get.
    pub fn ttl_for(&self, descriptor: &EngineDescriptor) -> Duration {
        descriptor.cache_ttl.unwrap_or(self.config.default_ttl)
    }

    /// Look up a previous `Success` for these inputs. Store failures read as
    /// a miss.
    pub async fn get(&self, engine: &str, inputs: &Value) -> Option<EngineResult> {
        if !self.config.enabled {
            return None;
        }
        let key = CacheKey::compute(engine, inputs);

        match self.load(&key).await {
            Ok(Some(entry)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(%key, engine, "cache hit");
                Some(EngineResult::Success {
                    value: entry.value,
                    produced_at: entry.created_at,
                    from_cache: true,
                })
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(%key, engine, "cache miss");
                None
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                warn!(%key, engine, "cache get error: {e}");
                None
            }
        }
    }

    /// Store a `Success` result. Returns whether anything was written.
    ///
    /// Non-success results, a zero TTL and a disabled cache all skip the
    /// write.
    pub async fn put(&self, engine: &str, inputs: &Value, result: &EngineResult, ttl: Duration) -> bool {
        let EngineResult::Success { value, produced_at, .. } = result else {
            return false;
        };
        if !self.config.enabled || ttl.is_zero() {
            return false;
        }

        let entry = CacheEntry {
            key: CacheKey::compute(engine, inputs),
            engine: engine.to_owned(),
            inputs: inputs.clone(),
            value: value.clone(),
            created_at: *produced_at,
            ttl_secs: ttl.as_secs(),
        };

        match self.store_entry(&entry, ttl).await {
            Ok(()) => {
                debug!(key = %entry.key, engine, ttl_secs = entry.ttl_secs, "cache set");
                true
            }
            Err(e) => {
                warn!(key = %entry.key, engine, "cache set error: {e}");
                false
            }
        }
    }

    /// Remove every entry whose stored record matches `predicate`.
    /// Returns the number of entries removed.
    pub async fn invalidate<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheEntry) -> bool + Send + Sync,
    {
        match self.invalidate_matching(KEY_PREFIX, &predicate).await {
            Ok(removed) => {
                debug!(removed, "cache invalidate by predicate");
                removed
            }
            Err(e) => {
                warn!("cache invalidate error: {e}");
                0
            }
        }
    }

    /// Drop every entry computed by `engine`.
    pub async fn invalidate_engine(&self, engine: &str) -> usize {
        match self.store.invalidate_by_prefix(&engine_prefix(engine)).await {
            Ok(removed) => {
                debug!(engine, removed, "cache invalidate engine");
                removed
            }
            Err(e) => {
                warn!(engine, "cache invalidate engine error: {e}");
                0
            }
        }
    }

    /// Drop every entry whose request inputs had `key == value`, e.g.
    /// `("profile", <old profile>)` after a profile update.
    pub async fn invalidate_input(&self, key: &str, value: &Value) -> usize {
        self.invalidate(|entry| entry.inputs.get("request").and_then(|r| r.get(key)) == Some(value))
            .await
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 { hits as f64 / total as f64 } else { 0.0 };
        CacheStats { hits, misses, hit_rate }
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        match self.store.get(key.as_str()).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store_entry(&self, entry: &CacheEntry, ttl: Duration) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(entry)?;
        self.store.put(entry.key.as_str(), bytes, ttl).await
    }

    async fn invalidate_matching<F>(&self, prefix: &str, predicate: &F) -> Result<usize, CacheError>
    where
        F: Fn(&CacheEntry) -> bool + Send + Sync,
    {
        let mut removed = 0usize;
        for key in self.store.keys_with_prefix(prefix).await? {
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            // Undecodable entries can never be served; drop them as well.
            let matches = serde_json::from_slice::<CacheEntry>(&bytes)
                .map(|entry| predicate(&entry))
                .unwrap_or(true);
            if matches && self.store.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::FailureKind;
    use serde_json::json;

    fn cache() -> FingerprintCache {
        FingerprintCache::new(Arc::new(InMemoryStore::new()), &CacheConfig::default())
    }

    fn inputs(user: &str, days: u32) -> Value {
        json!({ "request": { "user_id": user, "days": days }, "upstream": {} })
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn put_then_get_is_a_hit_from_cache() {
        let cache = cache();
        let result = EngineResult::success(json!({ "intent": "trip" }));
        assert!(cache.put("nlp", &inputs("u-1", 3), &result, HOUR).await);

        let hit = cache.get("nlp", &inputs("u-1", 3)).await.expect("hit");
        assert!(hit.from_cache());
        assert_eq!(hit.value(), Some(&json!({ "intent": "trip" })));
        assert!(cache.get("nlp", &inputs("u-1", 4)).await.is_none());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn only_success_results_are_stored() {
        let cache = cache();
        let degraded = EngineResult::Degraded { value: json!({}), reason: "fallback".into() };
        let failed = EngineResult::failed("nlp", FailureKind::Permanent, "boom");

        assert!(!cache.put("nlp", &inputs("u-1", 3), &degraded, HOUR).await);
        assert!(!cache.put("nlp", &inputs("u-1", 3), &failed, HOUR).await);
        assert!(cache.get("nlp", &inputs("u-1", 3)).await.is_none());
    }

    #[tokio::test]
    async fn zero_ttl_and_disabled_cache_bypass_storage() {
        let cache = cache();
        let result = EngineResult::success(json!({}));
        assert!(!cache.put("nlp", &inputs("u-1", 3), &result, Duration::ZERO).await);
        assert!(cache.get("nlp", &inputs("u-1", 3)).await.is_none());

        let disabled = FingerprintCache::new(
            Arc::new(InMemoryStore::new()),
            &CacheConfig { enabled: false, ..CacheConfig::default() },
        );
        assert!(!disabled.put("nlp", &inputs("u-1", 3), &result, HOUR).await);
        assert!(disabled.get("nlp", &inputs("u-1", 3)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_read_as_empty() {
        let cache = cache();
        let result = EngineResult::success(json!({}));
        cache.put("weather", &inputs("u-1", 3), &result, Duration::from_secs(30)).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get("weather", &inputs("u-1", 3)).await.is_none());
    }

    #[tokio::test]
    async fn invalidation_by_input_value_and_engine() {
        let cache = cache();
        let result = EngineResult::success(json!({}));
        cache.put("profile", &inputs("u-1", 3), &result, HOUR).await;
        cache.put("budget", &inputs("u-1", 5), &result, HOUR).await;
        cache.put("budget", &inputs("u-2", 3), &result, HOUR).await;

        assert_eq!(cache.invalidate_input("user_id", &json!("u-1")).await, 2);
        assert!(cache.get("budget", &inputs("u-2", 3)).await.is_some());

        assert_eq!(cache.invalidate_engine("budget").await, 1);
        assert!(cache.get("budget", &inputs("u-2", 3)).await.is_none());
    }

    #[test]
    fn descriptor_ttl_overrides_default() {
        let cache = cache();
        assert_eq!(cache.ttl_for(&EngineDescriptor::new("nlp")), HOUR);
        assert_eq!(
            cache.ttl_for(&EngineDescriptor::new("weather").cache_ttl(Duration::from_secs(60))),
            Duration::from_secs(60)
        );
    }
}
