//! httpx - a resilient HTTP client.
//!
//! [`Client`] wraps a pluggable [`Transport`](http::Transport) with three
//! layers, applied in order for every request:
//!
//! 1. an optional response [`Cache`](cache::Cache), consulted before any
//!    network traffic and populated with the final response;
//! 2. a bounded retry loop driven by a [`RetryPolicy`], which backs off
//!    with jittered delays and honors `Retry-After`;
//! 3. a [`RateLimiter`](rate_limit::RateLimiter) that paces retries.
//!
//! All waits observe the caller's [`Context`], so a request can be canceled
//! or given a deadline at any point.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod rate_limit;

pub use config::ClientConfig;
pub use context::{Cause, Context};
pub use error::{Error, Result};
pub use http::{Client, ClientBuilder, Request, Response, RetryPolicy, UserAgent};

/// Product token used in the default `User-Agent` and cache namespace.
pub const NAME: &str = "httpx";

/// Version baked in at build time from `git describe`.
pub const VERSION: &str = env!("HTTPX_VERSION");
