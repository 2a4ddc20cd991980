//! Client-side rate limiting of retry attempts.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::time::Instant;

use crate::context::Context;
use crate::error::{Error, Result};

/// Default sustained rate of [`TokenBucket::default`].
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 2.0;
/// Default burst of [`TokenBucket::default`].
pub const DEFAULT_BURST: u32 = 1;

/// Suspends callers until they may proceed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Waits for a token, or fails once `ctx` is done.
    async fn wait(&self, ctx: &Context) -> Result<()>;
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

/// Token bucket that refills continuously at `requests_per_second` up to
/// `burst` tokens.
///
/// Waiting reserves a token up front; a caller that gives up returns its
/// reservation.
#[derive(Debug)]
pub struct TokenBucket {
    requests_per_second: f64,
    burst: u32,
    state: Mutex<BucketState>,
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_SECOND, DEFAULT_BURST)
    }
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        Self {
            requests_per_second,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_update: Instant::now(),
            }),
        }
    }

    pub fn requests_per_second(&self) -> f64 {
        self.requests_per_second
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Takes a token, possibly going into debt, and returns how long the
    /// caller has to wait for it.
    fn reserve(&self) -> Result<Duration> {
        let mut state = self.lock()?;

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.requests_per_second).min(self.burst as f64);
        state.last_update = now;

        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            return Ok(Duration::ZERO);
        }
        Ok(Duration::from_secs_f64(-state.tokens / self.requests_per_second))
    }

    fn cancel_reservation(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.tokens = (state.tokens + 1.0).min(self.burst as f64);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BucketState>> {
        self.state
            .lock()
            .map_err(|_| Error::RateLimit("token bucket lock poisoned".into()))
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn wait(&self, ctx: &Context) -> Result<()> {
        if self.burst == 0 {
            return Err(Error::RateLimit("burst of zero never admits a request".into()));
        }
        if !(self.requests_per_second > 0.0) {
            return Err(Error::RateLimit(
                format!("invalid rate of {} requests per second", self.requests_per_second).into(),
            ));
        }
        if let Some(cause) = ctx.err() {
            return Err(Error::Canceled(cause));
        }

        let delay = self.reserve()?;
        if delay.is_zero() {
            return Ok(());
        }

        if let Some(remaining) = ctx.remaining() {
            if remaining < delay {
                self.cancel_reservation()?;
                return Err(Error::RateLimit(
                    format!("waiting {:?} would exceed the context deadline", delay).into(),
                ));
            }
        }

        debug!("Rate limiter delaying request by {:?}", delay);
        if let Err(cause) = ctx.sleep(delay).await {
            self.cancel_reservation()?;
            return Err(Error::Canceled(cause));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Cause;

    #[tokio::test(start_paused = true)]
    async fn test_burst_admits_immediately() {
        let bucket = TokenBucket::new(1.0, 3);
        let ctx = Context::background();
        let start = Instant::now();

        for _ in 0..3 {
            bucket.wait(&ctx).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_refill() {
        let bucket = TokenBucket::new(2.0, 1);
        let ctx = Context::background();
        let start = Instant::now();

        bucket.wait(&ctx).await.unwrap();
        bucket.wait(&ctx).await.unwrap();
        bucket.wait(&ctx).await.unwrap();

        // Two refills at 2 per second.
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_context_returns_reservation() {
        let bucket = TokenBucket::new(1.0, 1);
        bucket.wait(&Context::background()).await.unwrap();

        let ctx = Context::background();
        let canceler = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceler.cancel();
        });

        let err = bucket.wait(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Canceled(Cause::Canceled)));

        // The abandoned reservation was handed back, so one second after the
        // first token a fresh one is available again.
        let start = Instant::now();
        bucket.wait(&Context::background()).await.unwrap();
        assert!(start.elapsed() <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_beyond_deadline_fails_fast() {
        let bucket = TokenBucket::new(0.1, 1);
        bucket.wait(&Context::background()).await.unwrap();

        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let start = Instant::now();
        let err = bucket.wait(&ctx).await.unwrap_err();

        assert!(matches!(err, Error::RateLimit(_)));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_already_canceled() {
        let bucket = TokenBucket::default();
        let ctx = Context::background();
        ctx.cancel();

        let err = bucket.wait(&ctx).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_zero_burst_rejected() {
        let bucket = TokenBucket::new(5.0, 0);
        let err = bucket.wait(&Context::background()).await.unwrap_err();
        assert!(matches!(err, Error::RateLimit(_)));
    }

    #[tokio::test]
    async fn test_zero_rate_rejected() {
        let bucket = TokenBucket::new(0.0, 1);
        let err = bucket.wait(&Context::background()).await.unwrap_err();
        assert!(matches!(err, Error::RateLimit(_)));
    }

    #[test]
    fn test_defaults() {
        let bucket = TokenBucket::default();
        assert_eq!(bucket.requests_per_second(), 2.0);
        assert_eq!(bucket.burst(), 1);
    }
}
