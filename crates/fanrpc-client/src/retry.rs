//! Outcome classification and the retry / circuit-breaking wrapper every
//! dispatched call goes through.

use std::future::Future;

use fanrpc_common::{Code, Context, FanrpcError, Result};

use crate::backoff::{Attempt, Backoff};
use crate::circuit_breaker::{BreakerVerdict, CircuitBreaker};
use crate::handle::ConnectionHandle;

/// Errors that are never retried, whatever the state of the handle.
///
/// Cancellation, deadlines, an open breaker and a missing registry entry
/// are always fatal. A `NOT_FOUND` status from a handle dialed against a
/// literal IP is fatal too: a fixed IP that lost the resource will not get
/// it back by retrying.
pub fn is_fatal(err: &FanrpcError, is_ip_conn: bool) -> bool {
    if err.is_canceled_or_deadline() || err.is_circuit_open() || err.is_not_found() {
        return true;
    }
    is_ip_conn && err.code() == Some(Code::NotFound)
}

/// How an error counts towards the breaker of the address it came from.
///
/// Errors the caller caused, or that say nothing about the peer, are
/// ignored. Transport faults trip the breaker. Any other status means the
/// peer answered, which counts as a success.
pub fn breaker_verdict(err: &FanrpcError) -> BreakerVerdict {
    if err.is_canceled_or_deadline() || err.is_circuit_open() || err.is_not_found() {
        return BreakerVerdict::Ignore;
    }
    match err.code() {
        Some(code) if code.is_transport_fault() => BreakerVerdict::Failure,
        Some(_) => BreakerVerdict::Success,
        None => BreakerVerdict::Failure,
    }
}

pub(crate) fn breaker_key(method: &str, addr: &str) -> String {
    format!("{}/{}", method, addr)
}

/// Policies a call runs under.
#[derive(Clone, Copy, Default)]
pub(crate) struct Policies<'a> {
    pub backoff: Option<&'a dyn Backoff>,
    pub breaker: Option<&'a dyn CircuitBreaker>,
}

/// One classified attempt of `f` against `handle`, behind the breaker when
/// one is configured and the context names a method.
pub(crate) async fn attempt<H, T, F, Fut>(
    ctx: &Context,
    addr: &str,
    handle: &H,
    breaker: Option<&dyn CircuitBreaker>,
    f: &F,
) -> Attempt<T>
where
    H: ConnectionHandle,
    T: Send,
    F: Fn(Context, H::Conn) -> Fut + Sync,
    Fut: Future<Output = Result<T>> + Send,
{
    let call = || ctx.run(handle.run(ctx, |conn| f(ctx.clone(), conn)));
    let res = match (breaker, ctx.method()) {
        (Some(breaker), Some(method)) => {
            breaker
                .run(&breaker_key(method, addr), call, breaker_verdict)
                .await
        }
        _ => call().await,
    };

    match res {
        Ok(v) => Attempt::Done(v),
        Err(err) if is_fatal(&err, handle.is_ip_conn()) => Attempt::Stop(err),
        Err(err) => {
            if handle.is_healthy(ctx).await {
                Attempt::Retry(err)
            } else {
                Attempt::Stop(err)
            }
        }
    }
}

/// Runs `f` against `handle`, retrying under the backoff policy when one is
/// configured. The returned error names `addr`.
pub(crate) async fn execute<H, T, F, Fut>(
    ctx: &Context,
    addr: &str,
    handle: &H,
    policies: Policies<'_>,
    f: &F,
) -> Result<T>
where
    H: ConnectionHandle,
    T: Send,
    F: Fn(Context, H::Conn) -> Fut + Sync,
    Fut: Future<Output = Result<T>> + Send,
{
    let res = match policies.backoff {
        Some(backoff) => {
            backoff
                .run(ctx, |ctx| async move {
                    attempt(&ctx, addr, handle, policies.breaker, f).await
                })
                .await
        }
        None => attempt(ctx, addr, handle, policies.breaker, f)
            .await
            .into_result(),
    };
    res.map_err(|err| err.at_addr(addr))
}
