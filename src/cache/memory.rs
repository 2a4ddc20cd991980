use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use lru::LruCache;
use reqwest::header::CACHE_CONTROL;
use tokio::time::Instant;

use super::{Cache, CachePolicy};
use crate::error::{Error, Result};
use crate::http::Response;

/// TTL used by [`DefaultCachePolicy`] when the response does not say.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Entries kept by [`MemoryCache::new`] before the least recently used one
/// is evicted.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Upper bound applied when `now + ttl` would overflow.
const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Derives TTLs from `Cache-Control`.
///
/// Only successful responses are cached. `no-store`, `no-cache` and
/// `private` disable caching, `max-age=N` caches for N seconds, anything
/// else gets the default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultCachePolicy {
    pub default_ttl: Duration,
}

impl Default for DefaultCachePolicy {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl CachePolicy for DefaultCachePolicy {
    fn ttl(&self, response: &Response) -> Duration {
        if !response.is_success() {
            return Duration::ZERO;
        }

        let Some(cache_control) = response.header(CACHE_CONTROL) else {
            return self.default_ttl;
        };

        let mut ttl = self.default_ttl;
        for directive in cache_control.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            match directive.as_str() {
                "no-store" | "no-cache" | "private" => return Duration::ZERO,
                _ => {
                    if let Some(seconds) = directive
                        .strip_prefix("max-age=")
                        .and_then(|v| v.trim_matches('"').parse::<u64>().ok())
                    {
                        ttl = Duration::from_secs(seconds);
                    }
                }
            }
        }
        ttl
    }
}

struct Entry {
    response: Response,
    expires_at: Instant,
}

/// In-process LRU cache with per-entry expiry.
///
/// Holds at most `capacity` entries; inserting into a full cache evicts the
/// least recently used one. Expired entries are dropped on lookup, and all
/// of them are swept before an insert into a full cache.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, Entry>>,
    policy: Arc<dyn CachePolicy>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    /// Cache with [`DefaultCachePolicy`] and [`DEFAULT_CACHE_CAPACITY`].
    pub fn new() -> Self {
        Self::with_policy(Arc::new(DefaultCachePolicy::default()))
    }

    pub fn with_policy(policy: Arc<dyn CachePolicy>) -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY, policy)
    }

    /// A capacity of zero is raised to one.
    pub fn with_capacity(capacity: usize, policy: Arc<dyn CachePolicy>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries
            .lock()
            .map(|e| e.cap().get())
            .unwrap_or_default()
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        Ok(purge(&mut entries, Instant::now()))
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Cache("memory cache lock poisoned".into()))
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Response>> {
        let mut entries = self.lock()?;
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.response.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            debug!("Cache entry {} expired", key);
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, response: Response, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        let now = Instant::now();
        let entry = Entry {
            response,
            expires_at: now.checked_add(ttl).unwrap_or(now + MAX_TTL),
        };

        let mut entries = self.lock()?;
        if entries.len() >= entries.cap().get() && !entries.contains(key) {
            let purged = purge(&mut entries, now);
            if purged > 0 {
                debug!("Purged {} expired cache entries", purged);
            }
        }
        entries.put(key.to_string(), entry);
        Ok(())
    }

    fn policy(&self) -> Arc<dyn CachePolicy> {
        Arc::clone(&self.policy)
    }
}

fn purge(entries: &mut LruCache<String, Entry>, now: Instant) -> usize {
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| entry.expires_at <= now)
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        entries.pop(key);
    }
    expired.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use reqwest::header::HeaderValue;

    fn with_cache_control(value: &'static str) -> Response {
        Response::new(StatusCode::OK).with_header(CACHE_CONTROL, HeaderValue::from_static(value))
    }

    #[test]
    fn test_policy_default_ttl() {
        let policy = DefaultCachePolicy::default();
        assert_eq!(
            policy.ttl(&Response::new(StatusCode::OK)),
            DEFAULT_CACHE_TTL
        );
    }

    #[test]
    fn test_policy_max_age() {
        let policy = DefaultCachePolicy::default();
        assert_eq!(
            policy.ttl(&with_cache_control("public, max-age=60")),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_policy_no_store() {
        let policy = DefaultCachePolicy::default();
        assert_eq!(policy.ttl(&with_cache_control("no-store")), Duration::ZERO);
        assert_eq!(
            policy.ttl(&with_cache_control("max-age=60, No-Cache")),
            Duration::ZERO
        );
    }

    #[test]
    fn test_policy_error_status_not_cached() {
        let policy = DefaultCachePolicy::default();
        assert_eq!(
            policy.ttl(&Response::new(StatusCode::NOT_FOUND)),
            Duration::ZERO
        );
        assert_eq!(
            policy.ttl(&Response::new(StatusCode::SERVICE_UNAVAILABLE)),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_get_and_expire() {
        let cache = MemoryCache::new();
        let response = Response::new(StatusCode::OK).with_body("cached");

        cache
            .set("key", response.clone(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(cache.get("key").await.unwrap(), Some(response));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("key").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_zero_ttl_not_stored() {
        let cache = MemoryCache::new();
        cache
            .set("key", Response::new(StatusCode::OK), Duration::ZERO)
            .await
            .unwrap();
        assert!(cache.get("key").await.unwrap().is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache
            .set("key", Response::new(StatusCode::OK).with_body("first"), ttl)
            .await
            .unwrap();
        cache
            .set("key", Response::new(StatusCode::OK).with_body("second"), ttl)
            .await
            .unwrap();

        let cached = cache.get("key").await.unwrap().unwrap();
        assert_eq!(cached.text(), "second");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_custom_policy_is_returned() {
        let mut policy = super::super::MockCachePolicy::new();
        policy
            .expect_ttl()
            .returning(|_| Duration::from_secs(7));
        let cache = MemoryCache::with_policy(Arc::new(policy));

        let ttl = cache.policy().ttl(&Response::new(StatusCode::OK));
        assert_eq!(ttl, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let cache = MemoryCache::with_capacity(2, Arc::new(DefaultCachePolicy::default()));
        let ttl = Duration::from_secs(60);
        for key in ["a", "b"] {
            cache
                .set(key, Response::new(StatusCode::OK).with_body(key), ttl)
                .await
                .unwrap();
        }
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a").await.unwrap().is_some());

        cache
            .set("c", Response::new(StatusCode::OK).with_body("c"), ttl)
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_stay_bounded() {
        let cache = MemoryCache::with_capacity(16, Arc::new(DefaultCachePolicy::default()));
        for i in 0..1000 {
            cache
                .set(
                    &format!("https://example.com/{}", i),
                    Response::new(StatusCode::OK),
                    Duration::from_secs(1),
                )
                .await
                .unwrap();
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert!(cache.len() <= 16);
        assert_eq!(cache.capacity(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = MemoryCache::new();
        cache
            .set("short", Response::new(StatusCode::OK), Duration::from_secs(1))
            .await
            .unwrap();
        cache
            .set("long", Response::new(StatusCode::OK), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("long").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_prefers_dropping_expired_entries() {
        let cache = MemoryCache::with_capacity(2, Arc::new(DefaultCachePolicy::default()));
        cache
            .set("fresh", Response::new(StatusCode::OK), Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set("stale", Response::new(StatusCode::OK), Duration::from_secs(1))
            .await
            .unwrap();
        // "fresh" is the least recently used entry, "stale" has expired.
        tokio::time::advance(Duration::from_secs(2)).await;
        cache
            .set("new", Response::new(StatusCode::OK), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get("fresh").await.unwrap().is_some());
        assert!(cache.get("new").await.unwrap().is_some());
    }

    #[test]
    fn test_zero_capacity_raised_to_one() {
        let cache = MemoryCache::with_capacity(0, Arc::new(DefaultCachePolicy::default()));
        assert_eq!(cache.capacity(), 1);
    }
}
