//! Retry classification and jittered backoff.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;

use super::Response;
use crate::context::Context;
use crate::error::{Error, Result};

/// Fraction of the base delay used as symmetric jitter.
pub const JITTER_FRACTION: f64 = 0.25;

/// Default number of attempts per request, including the first one.
pub const DEFAULT_MAX_RETRIES: usize = 4;

pub const DEFAULT_MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Status codes retried by [`RetryPolicy::default`].
pub const DEFAULT_RETRYABLE_STATUS_CODES: [StatusCode; 8] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::BAD_GATEWAY,
    StatusCode::GATEWAY_TIMEOUT,
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::CONFLICT,
    StatusCode::PRECONDITION_FAILED,
    StatusCode::LOCKED,
];

/// Source of uniformly distributed integers used for jitter.
#[cfg_attr(test, mockall::automock)]
pub trait RandomSource: Send + Sync {
    /// Returns a value in `[0, n)`, or 0 when `n` is 0.
    fn uniform(&self, n: u64) -> u64;
}

/// Draws from the operating system's CSPRNG, so independent processes do
/// not produce correlated jitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn uniform(&self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        rand::rngs::OsRng.gen_range(0..n)
    }
}

/// Decides which responses are retried and how long to wait in between.
#[derive(Clone)]
pub struct RetryPolicy {
    retryable_status_codes: HashSet<StatusCode>,
    /// Total number of attempts for one request, including the first.
    pub max_retries: usize,
    pub min_retry_delay: Duration,
    pub max_retry_delay: Duration,
    random: Arc<dyn RandomSource>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retryable_status_codes", &self.retryable_status_codes())
            .field("max_retries", &self.max_retries)
            .field("min_retry_delay", &self.min_retry_delay)
            .field("max_retry_delay", &self.max_retry_delay)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect(),
            max_retries: DEFAULT_MAX_RETRIES,
            min_retry_delay: DEFAULT_MIN_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            random: Arc::new(OsRandom),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_min_retry_delay(mut self, delay: Duration) -> Self {
        self.min_retry_delay = delay;
        self
    }

    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// Replaces the whole set of retryable status codes.
    pub fn with_retryable_status_codes(
        mut self,
        codes: impl IntoIterator<Item = StatusCode>,
    ) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn with_random_source(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// The retryable status codes in ascending order.
    pub fn retryable_status_codes(&self) -> Vec<StatusCode> {
        let mut codes: Vec<StatusCode> = self.retryable_status_codes.iter().copied().collect();
        codes.sort();
        codes
    }

    /// Number of attempts a request gets; never less than one.
    pub fn attempts(&self) -> usize {
        self.max_retries.max(1)
    }

    /// True if the response's status code is in the retryable set.
    pub fn should_retry(&self, response: &Response) -> bool {
        self.retryable_status_codes.contains(&response.status)
    }

    /// Delay before the next attempt.
    ///
    /// The base delay is the integer `Retry-After` seconds if present and
    /// parseable, otherwise `min_retry_delay`. The jittered result is
    /// clamped into `[min_retry_delay, max_retry_delay]`; a `max_retry_delay`
    /// below `min_retry_delay` is treated as equal to it.
    pub fn retry_after(&self, response: &Response) -> Duration {
        let delay = response
            .header(RETRY_AFTER)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.min_retry_delay);

        let max = self.max_retry_delay.max(self.min_retry_delay);
        self.jitter(delay).clamp(self.min_retry_delay, max)
    }

    /// Suspends until the retry delay for `response` has elapsed or `ctx`
    /// is done.
    #[tracing::instrument(skip(self, ctx, response), fields(status = %response.status))]
    pub async fn wait(&self, ctx: &Context, response: &Response) -> Result<()> {
        let delay = self.retry_after(response);
        debug!("Waiting {:?} before retrying...", delay);

        ctx.sleep(delay).await.map_err(Error::RetryCanceled)
    }

    /// Draws uniformly from `[delay * (1 - f), delay * (1 + f))`.
    fn jitter(&self, delay: Duration) -> Duration {
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        let range = (nanos as f64 * JITTER_FRACTION) as u64;
        let lower = nanos - range;
        let offset = self.random.uniform(range.saturating_mul(2));

        Duration::from_nanos(lower.saturating_add(offset))
    }
}
