//! Error types returned by the client and its collaborators.

use std::time::Duration;

use reqwest::StatusCode;

use crate::context::Cause;

/// Boxed error used to carry causes from pluggable collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by [`Client::execute`](crate::Client::execute) and the
/// helpers around it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying transport could not be constructed.
    #[error("failed to initialize transport: {0}")]
    Initialization(#[source] BoxError),

    /// Network or TLS failure reported by the transport. Never retried.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// The caller's context was canceled or ran out of time while the
    /// request was suspended.
    #[error("request canceled")]
    Canceled(#[source] Cause),

    /// The request deadline was exceeded while the transport was in flight.
    #[error("request timed out")]
    Timeout(#[source] BoxError),

    /// A backoff wait between two attempts was interrupted.
    #[error("retry canceled")]
    RetryCanceled(#[source] Cause),

    /// The rate limiter refused to hand out a token.
    #[error("rate limiter error: {0}")]
    RateLimit(#[source] BoxError),

    /// Reading from or writing to the response cache failed.
    #[error("cache error: {0}")]
    Cache(#[source] BoxError),

    /// Every attempt produced a retryable response.
    #[error(
        "retry limit exceeded: max retries {max_retries}, last status {status}, retry after {retry_after:?}"
    )]
    RetryBudgetExceeded {
        max_retries: usize,
        status: StatusCode,
        retry_after: Duration,
    },

    #[error("invalid HTTP method {0}")]
    InvalidMethod(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A client configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(#[source] BoxError),
}

impl Error {
    /// Returns the cancellation cause for [`Error::Canceled`] and
    /// [`Error::RetryCanceled`], or for a timeout caused by the context
    /// deadline.
    pub fn cancel_cause(&self) -> Option<Cause> {
        match self {
            Error::Canceled(cause) | Error::RetryCanceled(cause) => Some(*cause),
            Error::Timeout(source) => source.downcast_ref::<Cause>().copied(),
            _ => None,
        }
    }

    /// True when the request failed because a deadline passed, either the
    /// transport's own timeout or the caller's context deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
            || self.cancel_cause() == Some(Cause::DeadlineExceeded)
    }

    /// True when the caller explicitly canceled the request.
    pub fn is_canceled(&self) -> bool {
        self.cancel_cause() == Some(Cause::Canceled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_retry_canceled_wraps_cause() {
        let err = Error::RetryCanceled(Cause::Canceled);
        assert_eq!(err.to_string(), "retry canceled");
        assert!(err.is_canceled());
        assert!(!err.is_timeout());

        let source = err.source().unwrap();
        assert_eq!(source.downcast_ref::<Cause>(), Some(&Cause::Canceled));
    }

    #[test]
    fn test_timeout_from_deadline() {
        let err = Error::Timeout(Box::new(Cause::DeadlineExceeded));
        assert!(err.is_timeout());
        assert_eq!(err.cancel_cause(), Some(Cause::DeadlineExceeded));
    }

    #[test]
    fn test_timeout_from_transport_has_no_cause() {
        let err = Error::Timeout("operation timed out".into());
        assert!(err.is_timeout());
        assert_eq!(err.cancel_cause(), None);
    }

    #[test]
    fn test_retry_budget_exceeded_display() {
        let err = Error::RetryBudgetExceeded {
            max_retries: 4,
            status: StatusCode::SERVICE_UNAVAILABLE,
            retry_after: Duration::from_secs(2),
        };
        let msg = err.to_string();
        assert!(msg.contains("max retries 4"));
        assert!(msg.contains("503"));
    }

    #[test]
    fn test_transport_error_is_neither_timeout_nor_canceled() {
        let err = Error::Transport("connection refused".into());
        assert!(!err.is_timeout());
        assert!(!err.is_canceled());
        assert!(err.to_string().contains("connection refused"));
    }
}
