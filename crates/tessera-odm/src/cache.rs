//! Read-through caching for find queries
//!
//! The ODM never evicts; it only looks values up and stores them on a miss.
//! Expiry belongs to the [`CacheProvider`].

use async_trait::async_trait;
use bson::Bson;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_common::{Result, TesseraError};
use tracing::{debug, warn};

/// External cache used by cache-tagged queries
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// `None` is a miss; any stored value, including `Null`, is a hit
    async fn get(&self, key: &str) -> Result<Option<Bson>>;

    /// Store `value`; `ttl` of `None` means no expiry
    async fn set(&self, key: &str, value: Bson, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Cache tag attached to a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    pub key: String,
    pub ttl: Option<Duration>,
}

impl CacheOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Run `operation` through the cache.
///
/// Without options the operation runs directly. Without a provider the call
/// degrades to "always miss, never store". Concurrent misses on one key each
/// run the operation; there is no coalescing.
pub async fn use_caching<T, F, Fut>(
    provider: Option<&Arc<dyn CacheProvider>>,
    options: Option<&CacheOptions>,
    operation: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let Some(options) = options else {
        return operation().await;
    };
    let Some(provider) = provider else {
        warn!(key = %options.key, "cache requested but no cache provider is configured");
        return operation().await;
    };

    if let Some(cached) = provider.get(&options.key).await? {
        match bson::from_bson::<T>(cached) {
            Ok(value) => {
                debug!(key = %options.key, "cache hit");
                return Ok(value);
            }
            Err(e) => warn!(key = %options.key, error = %e, "discarding undecodable cache entry"),
        }
    }

    debug!(key = %options.key, "cache miss");
    let result = operation().await?;
    let stored = bson::to_bson(&result)?;
    provider.set(&options.key, stored, options.ttl).await?;
    Ok(result)
}

// ============================================================================
// In-memory provider
// ============================================================================

struct Entry {
    value: Bson,
    expires_at: Option<Instant>,
}

/// Process-local cache backed by a concurrent map
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries; expired ones are dropped lazily
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.expires_at.map_or(true, |at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bson>> {
        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) => match entry.expires_at {
                Some(at) if at <= Instant::now() => true,
                _ => return Ok(Some(entry.value.clone())),
            },
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bson, ttl: Option<Duration>) -> Result<()> {
        let expires_at = match ttl {
            Some(ttl) => Some(Instant::now().checked_add(ttl).ok_or_else(|| {
                TesseraError::Cache(format!("TTL out of range for key '{}'", key))
            })?),
            None => None,
        };
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, Document};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn provider() -> Arc<dyn CacheProvider> {
        Arc::new(MemoryCache::new())
    }

    #[tokio::test]
    async fn test_without_options_runs_directly() {
        let cache = provider();
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let value: i64 = use_caching(Some(&cache), None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = provider();
        let options = CacheOptions::new("users:active");
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let docs: Vec<Document> = use_caching(Some(&cache), Some(&options), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![doc! { "name": "Ada" }])
            })
            .await
            .unwrap();
            assert_eq!(docs, vec![doc! { "name": "Ada" }]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stored_null_is_a_hit() {
        let cache = provider();
        let options = CacheOptions::new("users:missing");
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let found: Option<Document> = use_caching(Some(&cache), Some(&options), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();
            assert!(found.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_provider_never_stores() {
        let options = CacheOptions::new("k");
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let _: i64 = use_caching(None, Some(&options), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_are_not_coalesced() {
        let cache = provider();
        let options = CacheOptions::new("slow");
        let calls = AtomicUsize::new(0);

        let run = || {
            use_caching(Some(&cache), Some(&options), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok(vec![doc! { "n": 1 }])
            })
        };
        let (a, b): (Result<Vec<Document>>, Result<Vec<Document>>) = tokio::join!(run(), run());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_memory_cache_ttl_and_delete() {
        let cache = MemoryCache::new();
        cache
            .set("short", Bson::Int32(1), Some(Duration::from_millis(0)))
            .await
            .unwrap();
        cache.set("long", Bson::Int32(2), None).await.unwrap();

        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.get("long").await.unwrap(), Some(Bson::Int32(2)));
        assert_eq!(cache.len(), 1);

        cache.delete("long").await.unwrap();
        assert!(cache.is_empty());
    }
}
