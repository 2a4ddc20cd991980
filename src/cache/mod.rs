//! Cache-aside storage for responses.
//!
//! The client only depends on the [`Cache`] and [`CachePolicy`] traits.
//! [`MemoryCache`] is a bounded in-process LRU implementation with
//! per-entry expiry.

mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::http::{Request, Response};

pub use memory::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL, DefaultCachePolicy, MemoryCache};

/// Derives how long a response may be served from the cache.
#[cfg_attr(test, mockall::automock)]
pub trait CachePolicy: Send + Sync {
    /// A zero duration means the response must not be cached.
    fn ttl(&self, response: &Response) -> Duration;
}

/// Response store keyed by request fingerprint.
///
/// Implementations must tolerate concurrent use. Writes for the same key
/// are last-write-wins.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns the live entry for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Response>>;

    async fn set(&self, key: &str, response: Response, ttl: Duration) -> Result<()>;

    fn policy(&self) -> Arc<dyn CachePolicy>;
}

/// Deterministic cache key for a request.
///
/// Hashes the client namespace, the method and the normalized URL, so two
/// requests that differ only in query parameter order or fragment share a
/// key.
pub fn fingerprint(namespace: &str, request: &Request) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0]);
    hasher.update(request.method.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(normalize_url(&request.url).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Drops the fragment and sorts query parameters.
///
/// Scheme and host case and default ports are already normalized by URL
/// parsing.
pub fn normalize_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(&pairs);
    }

    url.to_string()
}
