//! Serializable client configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::cache::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL, DefaultCachePolicy, MemoryCache};
use crate::error::{Error, Result};
use crate::http::retry::{
    DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_DELAY, DEFAULT_MIN_RETRY_DELAY,
    DEFAULT_RETRYABLE_STATUS_CODES,
};
use crate::http::{Client, ClientBuilder, DEFAULT_TIMEOUT, RetryPolicy, UserAgent};
use crate::rate_limit::{DEFAULT_BURST, DEFAULT_REQUESTS_PER_SECOND, TokenBucket};

/// Durations as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Everything needed to build a [`Client`].
///
/// Missing fields fall back to the library defaults, so `{}` is a valid
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Cache key prefix.
    pub namespace: String,
    /// Overall timeout of the default transport, in milliseconds.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    /// Total attempts per request; `0` behaves like `1`.
    pub max_retries: usize,
    #[serde(rename = "min_retry_delay_ms", with = "millis")]
    pub min_retry_delay: Duration,
    #[serde(rename = "max_retry_delay_ms", with = "millis")]
    pub max_retry_delay: Duration,
    pub retryable_status_codes: Vec<u16>,
    /// Rate limit applied to retries; `null` disables it.
    pub rate_limit: Option<RateLimitConfig>,
    pub cache: CacheConfig,
    pub user_agent: UserAgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// TTL for responses without `Cache-Control`, in milliseconds.
    #[serde(rename = "default_ttl_ms", with = "millis")]
    pub default_ttl: Duration,
    /// Maximum number of cached responses.
    pub capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: crate::NAME.to_string(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            min_retry_delay: DEFAULT_MIN_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES
                .iter()
                .map(StatusCode::as_u16)
                .collect(),
            rate_limit: Some(RateLimitConfig::default()),
            cache: CacheConfig::default(),
            user_agent: UserAgent::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst: DEFAULT_BURST,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_ttl: DEFAULT_CACHE_TTL,
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e).into())
        })?;
        Self::from_json(&json)
    }

    /// Checks the fields that would otherwise only fail at request time.
    pub fn validate(&self) -> Result<()> {
        if self.min_retry_delay > self.max_retry_delay {
            return Err(Error::Config(
                format!(
                    "min_retry_delay ({:?}) exceeds max_retry_delay ({:?})",
                    self.min_retry_delay, self.max_retry_delay
                )
                .into(),
            ));
        }
        self.status_codes()?;
        if let Some(rate_limit) = &self.rate_limit {
            if !(rate_limit.requests_per_second > 0.0) || !rate_limit.requests_per_second.is_finite()
            {
                return Err(Error::Config(
                    format!(
                        "requests_per_second must be positive, got {}",
                        rate_limit.requests_per_second
                    )
                    .into(),
                ));
            }
            if rate_limit.burst == 0 {
                return Err(Error::Config("burst must be at least 1".into()));
            }
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(Error::Config("cache capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy::default()
            .with_max_retries(self.max_retries)
            .with_min_retry_delay(self.min_retry_delay)
            .with_max_retry_delay(self.max_retry_delay)
            .with_retryable_status_codes(self.status_codes()?))
    }

    /// Converts the configuration into a builder for further customization.
    pub fn into_builder(self) -> Result<ClientBuilder> {
        self.validate()?;

        let mut builder = Client::builder()
            .namespace(self.namespace.clone())
            .timeout(self.timeout)
            .retry_policy(self.retry_policy()?)
            .user_agent(self.user_agent);

        builder = match self.rate_limit {
            Some(rate_limit) => builder.rate_limiter(Arc::new(TokenBucket::new(
                rate_limit.requests_per_second,
                rate_limit.burst,
            ))),
            None => builder.no_rate_limiter(),
        };

        if self.cache.enabled {
            let policy = DefaultCachePolicy {
                default_ttl: self.cache.default_ttl,
            };
            builder = builder.cache(Arc::new(MemoryCache::with_capacity(
                self.cache.capacity,
                Arc::new(policy),
            )));
        }

        Ok(builder)
    }

    fn status_codes(&self) -> Result<Vec<StatusCode>> {
        self.retryable_status_codes
            .iter()
            .map(|&code| {
                StatusCode::from_u16(code)
                    .map_err(|_| Error::Config(format!("invalid status code {}", code).into()))
            })
            .collect()
    }
}
