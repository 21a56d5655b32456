//! Cancellation-carrying execution context.
//!
//! Every public entry point of the client takes a [`Context`]. It bundles a
//! cancellation token, an optional deadline and an optional RPC method name.
//! Children derived from a context are cancelled together with it, and can
//! only tighten the deadline, never extend it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{FanrpcError, Result};

#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
    method: Option<Arc<str>>,
}

impl Context {
    /// A root context that is never cancelled unless [`cancel`](Self::cancel)
    /// is called on it.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a child that is cancelled when `self` is, but can be cancelled
    /// on its own without affecting `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            method: self.method.clone(),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.child();
        ctx.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        ctx
    }

    pub fn with_method(&self, method: impl Into<Arc<str>>) -> Self {
        Self {
            token: self.token.clone(),
            deadline: self.deadline,
            method: Some(method.into()),
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// `Canceled` or `DeadlineExceeded` once the context is done.
    pub fn err(&self) -> Option<FanrpcError> {
        if self.token.is_cancelled() {
            return Some(FanrpcError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(FanrpcError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves with the reason once the context is cancelled or its
    /// deadline passes.
    pub async fn done(&self) -> FanrpcError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => FanrpcError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => FanrpcError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                FanrpcError::Canceled
            }
        }
    }

    /// Runs `fut` until it completes or the context is done, whichever comes
    /// first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_is_not_done() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let parent = Context::background();
        let child = parent.child();
        let grandchild = child.with_method("search");

        parent.cancel();
        assert!(matches!(child.err(), Some(FanrpcError::Canceled)));
        assert!(matches!(grandchild.err(), Some(FanrpcError::Canceled)));
    }

    #[tokio::test]
    async fn test_cancel_child_leaves_parent() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_never_extended() {
        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let wider = ctx.with_timeout(Duration::from_secs(10));
        assert_eq!(ctx.deadline(), wider.deadline());

        let narrower = ctx.with_timeout(Duration::from_millis(10));
        assert!(narrower.deadline().unwrap() < ctx.deadline().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_hits_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let res: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(FanrpcError::DeadlineExceeded)));
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_run_returns_future_result() {
        let ctx = Context::background();
        let res = ctx.run(async { Ok(7) }).await.unwrap();
        assert_eq!(res, 7);
    }

    #[tokio::test]
    async fn test_run_on_cancelled_context() {
        let ctx = Context::background();
        ctx.cancel();
        let res: Result<u32> = ctx.run(async { Ok(1) }).await;
        assert!(matches!(res, Err(FanrpcError::Canceled)));
    }

    #[test]
    fn test_with_method() {
        let ctx = Context::background().with_method("Search");
        assert_eq!(ctx.method(), Some("Search"));
        assert_eq!(ctx.child().method(), Some("Search"));
    }
}
