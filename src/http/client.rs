//! Request executor: cache lookup, bounded retry loop, cache store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderValue, USER_AGENT};
use tokio::sync::OnceCell;

use super::retry::RetryPolicy;
use super::transport::{ReqwestTransport, Transport};
use super::{Request, Response, UserAgent};
use crate::cache::{Cache, MemoryCache, fingerprint};
use crate::context::{Cause, Context};
use crate::error::{Error, Result};
use crate::rate_limit::{RateLimiter, TokenBucket};

/// Overall timeout of the default transport.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const FORM_URL_ENCODED: &str = "application/x-www-form-urlencoded";

type TransportFactory = Box<dyn Fn() -> Result<Arc<dyn Transport>> + Send + Sync>;

/// HTTP client that retries retryable responses with jittered backoff,
/// paces retries through a rate limiter and serves repeated requests from
/// a cache.
///
/// Cloning is cheap; clones share the transport, limiter and cache.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: OnceCell<Arc<dyn Transport>>,
    factory: TransportFactory,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    retry_policy: Option<RetryPolicy>,
    cache: Option<Arc<dyn Cache>>,
    user_agent: UserAgent,
    namespace: String,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("namespace", &self.inner.namespace)
            .field("retry_policy", &self.inner.retry_policy)
            .field("rate_limited", &self.inner.rate_limiter.is_some())
            .field("cached", &self.inner.cache.is_some())
            .field("user_agent", &self.inner.user_agent.to_string())
            .finish()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Client with the default retry policy, a 2 requests per second
    /// limiter on retries and no cache.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Like [`Client::new`] with a response cache; `None` selects an
    /// in-memory cache.
    pub fn with_cache(cache: Option<Arc<dyn Cache>>) -> Self {
        let cache = cache.unwrap_or_else(|| Arc::new(MemoryCache::new()));
        Self::builder().cache(cache).build()
    }

    /// Starts from the defaults of [`Client::new`].
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// The retry policy, or `None` when every request gets one attempt.
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.inner.retry_policy.as_ref()
    }

    /// Prefix mixed into every cache fingerprint.
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Sends a request through the cache, retry and rate limiting layers.
    ///
    /// Only GET and HEAD requests are served from or stored in the cache.
    /// Returns either the final response or the first unrecoverable error.
    /// Transport failures are never retried; only responses the retry
    /// policy classifies as retryable are.
    #[tracing::instrument(skip(self, ctx, request), fields(method = %request.method, url = %request.url))]
    pub async fn execute(&self, ctx: &Context, mut request: Request) -> Result<Response> {
        let transport = self.transport().await?;
        self.set_user_agent(&mut request);

        debug!("Starting request {} {}", request.method, request.url);

        let key = match &self.inner.cache {
            Some(cache) if is_cacheable(&request.method) => {
                let key = fingerprint(&self.inner.namespace, &request);
                if let Some(response) = cache.get(&key).await.map_err(into_cache_error)? {
                    debug!("Cache hit for request: {} {}", request.method, request.url);
                    return Ok(response);
                }
                Some(key)
            }
            _ => None,
        };

        let response = self.send_with_retry(ctx, transport.as_ref(), &request).await?;

        if let (Some(cache), Some(key)) = (&self.inner.cache, key) {
            let ttl = cache.policy().ttl(&response);
            cache
                .set(&key, response.clone(), ttl)
                .await
                .map_err(into_cache_error)?;
            debug!(
                "Cache set for request: {} {} (ttl {:?})",
                request.method, request.url, ttl
            );
        }

        Ok(response)
    }

    /// Sends a GET request to `url`.
    pub async fn get(&self, ctx: &Context, url: &str) -> Result<Response> {
        self.execute(ctx, Request::new(Method::GET, url)?).await
    }

    /// Sends a HEAD request to `url`.
    pub async fn head(&self, ctx: &Context, url: &str) -> Result<Response> {
        self.execute(ctx, Request::new(Method::HEAD, url)?).await
    }

    /// POSTs `body` with the given `Content-Type`.
    pub async fn post(
        &self,
        ctx: &Context,
        url: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<Response> {
        let request = Request::new(Method::POST, url)?
            .with_header(CONTENT_TYPE.as_str(), content_type)?
            .with_body(body);
        self.execute(ctx, request).await
    }

    /// POSTs `form` URL-encoded.
    pub async fn post_form(
        &self,
        ctx: &Context,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<Response> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form)
            .finish();
        self.post(ctx, url, FORM_URL_ENCODED, body).await
    }

    /// Returns the transport, constructing it on first use.
    ///
    /// Concurrent first callers share a single construction. A failed
    /// construction is reported to its callers and attempted again by the
    /// next call.
    async fn transport(&self) -> Result<Arc<dyn Transport>> {
        let transport = self
            .inner
            .transport
            .get_or_try_init(|| async { (self.inner.factory)() })
            .await?;
        Ok(Arc::clone(transport))
    }

    /// Runs the attempt loop for one request.
    async fn send_with_retry(
        &self,
        ctx: &Context,
        transport: &dyn Transport,
        request: &Request,
    ) -> Result<Response> {
        let max_retries = self.max_retries();
        let mut attempt = 0;

        loop {
            debug!(
                "Attempt {}/{} for request: {} {}",
                attempt + 1,
                max_retries,
                request.method,
                request.url
            );

            if attempt > 0 {
                self.apply_rate_limiter(ctx, request).await?;
            }

            let response = match transport.send(ctx, request).await {
                Ok(response) => response,
                Err(err) => return Err(classify_transport_error(ctx, err)),
            };

            let Some(policy) = &self.inner.retry_policy else {
                return Ok(response);
            };
            if !policy.should_retry(&response) {
                return Ok(response);
            }

            attempt += 1;
            if attempt >= max_retries {
                let retry_after = policy.retry_after(&response);
                warn!(
                    "{} {}: giving up after {} attempts, last status {}",
                    request.method, request.url, attempt, response.status
                );
                return Err(Error::RetryBudgetExceeded {
                    max_retries,
                    status: response.status,
                    retry_after,
                });
            }

            warn!(
                "{} {}: attempt {}/{} returned {}, retrying...",
                request.method, request.url, attempt, max_retries, response.status
            );
            policy.wait(ctx, &response).await?;
        }
    }

    /// Waits on the rate limiter. Only called before retries; the first
    /// attempt is never throttled.
    async fn apply_rate_limiter(&self, ctx: &Context, request: &Request) -> Result<()> {
        if let Some(limiter) = &self.inner.rate_limiter {
            debug!(
                "Applying rate limiter for request: {} {}",
                request.method, request.url
            );
            limiter.wait(ctx).await?;
        }
        Ok(())
    }

    fn max_retries(&self) -> usize {
        self.inner
            .retry_policy
            .as_ref()
            .map_or(1, RetryPolicy::attempts)
    }

    /// Sets `User-Agent` unless the caller already did.
    fn set_user_agent(&self, request: &mut Request) {
        if request.headers.contains_key(USER_AGENT) {
            return;
        }
        let user_agent = self.inner.user_agent.to_string();
        if user_agent.is_empty() {
            return;
        }
        if let Ok(value) = HeaderValue::from_str(&user_agent) {
            request.headers.insert(USER_AGENT, value);
        }
    }
}

/// Maps a failed transport call to the error surfaced to the caller.
///
/// A done context takes precedence over whatever the transport reported.
fn classify_transport_error(ctx: &Context, err: Error) -> Error {
    match ctx.err() {
        Some(Cause::Canceled) => Error::Canceled(Cause::Canceled),
        Some(Cause::DeadlineExceeded) => Error::Timeout(Box::new(Cause::DeadlineExceeded)),
        None => match err {
            Error::Transport(_) | Error::Timeout(_) | Error::Canceled(_) => err,
            other => Error::Transport(Box::new(other)),
        },
    }
}

/// Methods whose responses may be served from the cache.
fn is_cacheable(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

fn into_cache_error(err: Error) -> Error {
    match err {
        Error::Cache(_) => err,
        other => Error::Cache(Box::new(other)),
    }
}

/// Configures a [`Client`].
///
/// Starts from the defaults of [`Client::new`].
pub struct ClientBuilder {
    factory: Option<TransportFactory>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    retry_policy: Option<RetryPolicy>,
    cache: Option<Arc<dyn Cache>>,
    user_agent: UserAgent,
    namespace: String,
    timeout: Option<Duration>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            factory: None,
            rate_limiter: Some(Arc::new(TokenBucket::default())),
            retry_policy: Some(RetryPolicy::default()),
            cache: None,
            user_agent: UserAgent::default(),
            namespace: crate::NAME.to_string(),
            timeout: None,
        }
    }
}

impl ClientBuilder {
    /// Uses the given transport instead of the default reqwest one.
    pub fn transport(self, transport: Arc<dyn Transport>) -> Self {
        self.transport_factory(move || Ok(Arc::clone(&transport)))
    }

    /// Constructs the transport lazily on the first request.
    pub fn transport_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Transport>> + Send + Sync + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Paces retries through `limiter`.
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Retries are not throttled.
    pub fn no_rate_limiter(mut self) -> Self {
        self.rate_limiter = None;
        self
    }

    /// Retries retryable responses according to `policy`.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Every request gets exactly one attempt.
    pub fn no_retry_policy(mut self) -> Self {
        self.retry_policy = None;
        self
    }

    /// Serves GET and HEAD requests from `cache` when possible.
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// `User-Agent` sent when the request does not set one.
    pub fn user_agent(mut self, user_agent: UserAgent) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Prefix mixed into every cache fingerprint.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Overall timeout of the default transport. Ignored when a custom
    /// transport is supplied.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the client; the transport is constructed on first use.
    pub fn build(self) -> Client {
        let timeout = self.timeout.filter(|t| !t.is_zero()).unwrap_or(DEFAULT_TIMEOUT);
        let factory: TransportFactory = match self.factory {
            Some(factory) => factory,
            None => Box::new(move || -> Result<Arc<dyn Transport>> {
                Ok(Arc::new(ReqwestTransport::new(timeout)?))
            }),
        };

        Client {
            inner: Arc::new(ClientInner {
                transport: OnceCell::new(),
                factory,
                rate_limiter: self.rate_limiter,
                retry_policy: self.retry_policy,
                cache: self.cache,
                user_agent: self.user_agent,
                namespace: self.namespace,
            }),
        }
    }

    /// Builds the client and constructs its transport right away.
    pub fn try_build(self) -> Result<Client> {
        let client = self.build();
        let transport = (client.inner.factory)()?;
        // A fresh cell cannot be set already.
        let _ = client.inner.transport.set(transport);
        Ok(client)
    }
}
