use std::fmt;
use std::future::Future;
use std::time::Duration;

use fanrpc_common::{Context, FanrpcError, Result};
use serde::Deserialize;
use tracing::debug;

/// Outcome of a single attempt driven by a [`Backoff`].
#[derive(Debug)]
pub enum Attempt<T> {
    /// Finished, stop retrying.
    Done(T),
    /// Failed in a way that may succeed on another attempt.
    Retry(FanrpcError),
    /// Failed for good.
    Stop(FanrpcError),
}

impl<T> Attempt<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            Attempt::Done(v) => Ok(v),
            Attempt::Retry(err) | Attempt::Stop(err) => Err(err),
        }
    }
}

/// Retry policy.
///
/// Implementations only decide how long to wait before the next attempt;
/// [`run`](#method.run) drives the attempts themselves.
pub trait Backoff: fmt::Debug + Send + Sync {
    /// Delay before retry number `retry` (starting at 1), or `None` to give up.
    fn next_delay(&self, retry: u32) -> Option<Duration>;
}

impl<'a> dyn Backoff + 'a {
    /// Calls `f` until it returns [`Attempt::Done`] or [`Attempt::Stop`], the
    /// policy gives up, or `ctx` is done.
    ///
    /// When the policy gives up the last attempt's error is returned.
    pub async fn run<T, F, Fut>(&self, ctx: &Context, mut f: F) -> Result<T>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let mut retry = 0u32;
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            let err = match f(ctx.clone()).await {
                Attempt::Done(v) => return Ok(v),
                Attempt::Stop(err) => return Err(err),
                Attempt::Retry(err) => err,
            };

            retry += 1;
            let Some(delay) = self.next_delay(retry) else {
                debug!(attempts = retry, error = %err, "backoff gave up");
                return Err(err);
            };
            debug!(
                retry,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                ctx_err = ctx.done() => return Err(FanrpcError::Multiple(vec![err, ctx_err])),
            }
        }
    }
}

/// Exponential backoff.
///
/// - Retry 1: wait `initial_backoff_ms` (default: 50ms)
/// - Retry 2: wait `initial_backoff_ms * multiplier` (default: 100ms)
/// - Retry n: wait `initial_backoff_ms * multiplier^(n-1)`
/// - Capped at `max_backoff_ms` (default: 5000ms)
///
/// # Example
///
/// ```rust
/// use fanrpc_client::{Backoff, ExponentialBackoff};
/// use std::time::Duration;
///
/// let backoff = ExponentialBackoff::default();
/// assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(50)));
/// assert_eq!(backoff.next_delay(3), Some(Duration::from_millis(200)));
/// assert_eq!(backoff.next_delay(4), None);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExponentialBackoff {
    /// Maximum number of retries (excluding the initial attempt)
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound for any delay in milliseconds
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let exp = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exp);
        let ms = ms.min(self.max_backoff_ms as f64) as u64;
        Some(Duration::from_millis(ms))
    }
}
