//! HTTP client with retry, rate limiting and response caching.

mod client;
mod request;
mod response;
pub mod retry;
mod transport;
mod user_agent;

pub use client::{Client, ClientBuilder, DEFAULT_TIMEOUT};
pub use request::Request;
pub use response::{Response, write_json};
pub use retry::{OsRandom, RandomSource, RetryPolicy};
pub use transport::{ReqwestTransport, Transport};
pub use user_agent::UserAgent;
