//! Cancellation and deadline propagation for requests.
//!
//! A [`Context`] is passed into every suspension point of a request: the
//! rate limiter wait, the backoff wait and the transport call. Canceling a
//! context (or letting its deadline pass) wakes all of them.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Cause {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation token plus an optional deadline.
///
/// Cloning a context shares its cancellation state. Derived contexts
/// ([`Context::with_timeout`], [`Context::child`]) are canceled when their
/// parent is, but canceling a child leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never done unless explicitly canceled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context that is canceled together with `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a context whose deadline is `timeout` from now, or the
    /// parent's deadline if that is earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a context with the given deadline, or the parent's deadline
    /// if that is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns the cause if the context is already done.
    ///
    /// Explicit cancellation takes precedence over an expired deadline.
    pub fn err(&self) -> Option<Cause> {
        if self.token.is_cancelled() {
            return Some(Cause::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Cause::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is canceled or its deadline passes.
    pub async fn done(&self) -> Cause {
        if let Some(cause) = self.err() {
            return cause;
        }
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Cause::Canceled,
                    _ = tokio::time::sleep_until(deadline) => Cause::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Cause::Canceled
            }
        }
    }

    /// Sleeps for `duration` unless the context finishes first, in which
    /// case the cause is returned.
    ///
    /// Every call owns its own timer, so concurrent sleeps on clones of the
    /// same context never interfere with each other.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cause> {
        if let Some(cause) = self.err() {
            return Err(cause);
        }
        tokio::select! {
            biased;
            cause = self.done() => Err(cause),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_is_not_done() {
        let ctx = Context::background();
        assert_eq!(ctx.err(), None);
        assert_eq!(ctx.deadline(), None);
        assert_eq!(ctx.remaining(), None);
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children_only() {
        let parent = Context::background();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert_eq!(child.err(), Some(Cause::Canceled));
        assert_eq!(parent.err(), None);
        assert_eq!(sibling.err(), None);

        parent.cancel();
        assert_eq!(sibling.err(), Some(Cause::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        assert_eq!(ctx.err(), None);

        let cause = ctx.done().await;
        assert_eq!(cause, Cause::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(Cause::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_keeps_earlier_parent_deadline() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes() {
        let ctx = Context::background();
        let start = Instant::now();
        ctx.sleep(Duration::from_secs(3)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let start = Instant::now();
        let result = ctx.sleep(Duration::from_secs(5)).await;
        assert_eq!(result, Err(Cause::DeadlineExceeded));
        assert!(start.elapsed() <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_cancel() {
        let ctx = Context::background();
        let canceler = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceler.cancel();
        });

        let result = ctx.sleep(Duration::from_secs(30)).await;
        assert_eq!(result, Err(Cause::Canceled));
    }
}
