//! The network transport consumed by the client.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::{Request, Response};
use crate::context::{Cause, Context};
use crate::error::{Error, Result};

/// Connect timeout of the default transport.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// TCP keepalive interval of the default transport.
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
/// How long idle pooled connections are kept.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Sends a single request and reads its response.
///
/// Implementations own connection pooling and TLS, and must give up once
/// `ctx` is done. Failures are reported as [`Error::Transport`],
/// [`Error::Timeout`] or [`Error::Canceled`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, ctx: &Context, request: &Request) -> Result<Response>;
}

/// Transport backed by a [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds the default transport with the given overall request timeout.
    ///
    /// Redirects are not followed: a 3xx response is returned to the caller
    /// as-is.
    ///
    /// The TLS handshake has no timeout of its own; it is bounded by the
    /// connect timeout. Idle connections are capped per host only.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .redirect(reqwest::redirect::Policy::none())
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .build()
            .map_err(|e| Error::Initialization(Box::new(e)))?;

        Ok(Self { client })
    }

    /// Wraps an already configured client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[tracing::instrument(skip(self, ctx, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, ctx: &Context, request: &Request) -> Result<Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let exchange = async {
            let response = builder.send().await?;
            Response::read(response).await
        };

        tokio::select! {
            biased;
            cause = ctx.done() => {
                debug!("Request {} {} abandoned: {}", request.method, request.url, cause);
                Err(match cause {
                    Cause::Canceled => Error::Canceled(cause),
                    Cause::DeadlineExceeded => Error::Timeout(Box::new(cause)),
                })
            }
            result = exchange => result.map_err(classify_reqwest_error),
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(Box::new(err))
    } else {
        Error::Transport(Box::new(err))
    }
}
