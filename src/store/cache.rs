use authcore::codec::Value;
use authcore::store::{Retention, now_ms};
use moka::future::Cache;
use std::time::Duration;

/// moka rejects longer TTLs; the per-entry `written_at` check still enforces
/// the full retention window.
const MAX_CACHE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Clone)]
struct CachedValue {
    value: Value,
    written_at: i64,
}

/// Write-through read cache keyed by physical id.
///
/// Entries carry the time the backing row was last written, so a cached value
/// expires exactly when the row would.
#[derive(Clone)]
pub struct KeyCache {
    inner: Option<Cache<String, CachedValue>>,
    retention: Retention,
}

impl KeyCache {
    /// `capacity` of `None` disables caching.
    pub fn new(capacity: Option<u64>, retention: Retention) -> Self {
        let inner = capacity.map(|capacity| {
            let builder = Cache::builder().max_capacity(capacity);
            match retention.window() {
                Some(window) => builder.time_to_live(window.min(MAX_CACHE_TTL)).build(),
                None => builder.build(),
            }
        });
        Self { inner, retention }
    }

    pub fn disabled() -> Self {
        Self::new(None, Retention::disabled())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub async fn get(&self, id: &str) -> Option<Value> {
        let cache = self.inner.as_ref()?;
        let cached = cache.get(id).await?;
        if self.retention.is_expired(cached.written_at, now_ms()) {
            cache.invalidate(id).await;
            return None;
        }
        Some(cached.value)
    }

    pub async fn insert(&self, id: &str, value: Value, written_at: i64) {
        if let Some(cache) = &self.inner {
            cache
                .insert(id.to_string(), CachedValue { value, written_at })
                .await;
        }
    }

    pub async fn invalidate(&self, id: &str) {
        if let Some(cache) = &self.inner {
            cache.invalidate(id).await;
        }
    }

    pub fn invalidate_all(&self) {
        if let Some(cache) = &self.inner {
            cache.invalidate_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_get_invalidate() {
        let cache = KeyCache::new(Some(16), Retention::default());
        cache.insert("a", Value::from("x"), now_ms()).await;
        assert_eq!(cache.get("a").await, Some(Value::from("x")));

        cache.invalidate("a").await;
        assert_eq!(cache.get("a").await, None);
    }

    #[tokio::test]
    async fn test_stale_entries_are_not_served() {
        let cache = KeyCache::new(Some(16), Retention::new(Duration::from_secs(60)));
        cache.insert("old", Value::from(1i64), now_ms() - 61_000).await;
        cache.insert("new", Value::from(2i64), now_ms()).await;

        assert_eq!(cache.get("old").await, None);
        assert_eq!(cache.get("new").await, Some(Value::from(2i64)));
    }

    #[tokio::test]
    async fn test_disabled_cache_stores_nothing() {
        let cache = KeyCache::disabled();
        cache.insert("a", Value::from("x"), now_ms()).await;
        assert!(!cache.is_enabled());
        assert_eq!(cache.get("a").await, None);
    }

    #[tokio::test]
    async fn test_huge_retention_is_accepted() {
        let cache = KeyCache::new(Some(16), Retention::new(Duration::from_secs(u64::MAX)));
        cache.insert("a", Value::from("x"), now_ms()).await;
        assert_eq!(cache.get("a").await, Some(Value::from("x")));
    }
}
