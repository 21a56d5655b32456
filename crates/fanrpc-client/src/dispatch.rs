//! Call dispatch strategies.
//!
//! Every strategy runs the caller's function through the retry /
//! circuit-breaking wrapper with the configured call options applied. One
//! failing address never stops calls to the others, except in
//! [`round_robin`](Client::round_robin) (first success wins) and when a call
//! is cancelled or runs out of time.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use fanrpc_common::{Context, FanrpcError, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, warn};

use crate::backoff::Attempt;
use crate::client::{Client, Handle};
use crate::handle::{ConnectionHandle, Dialer};
use crate::retry;

type Entries<D> = Vec<(String, Arc<Handle<D>>)>;

impl<D: Dialer> Client<D> {
    /// Applies the configured call options.
    fn call_ctx(&self, ctx: &Context) -> Context {
        match self.inner.config.call.timeout() {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        }
    }

    /// Calls `f` against `addr`.
    ///
    /// Fails with [`FanrpcError::ConnectionNotFound`] when `addr` has no
    /// registered handle.
    pub async fn call<T, F, Fut>(&self, ctx: &Context, addr: &str, f: F) -> Result<T>
    where
        T: Send,
        F: Fn(Context, <D::Handle as ConnectionHandle>::Conn) -> Fut + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let Some(handle) = self.inner.registry.load(addr) else {
            return Err(FanrpcError::ConnectionNotFound(addr.to_string()));
        };
        let ctx = self.call_ctx(ctx);
        retry::execute(&ctx, addr, handle.as_ref(), self.policies(), &f).await
    }

    /// Calls `f` against every registered address, one after another, in
    /// address order.
    ///
    /// Per-address failures are logged and do not stop the sweep, including
    /// a call that hit its own timeout or a peer `DEADLINE_EXCEEDED`.
    ///
    /// # Arguments
    ///
    /// - `ctx`: Bounds the whole sweep; once it is done no further address
    ///   is visited
    /// - `f`: Called with the per-call context, the address and a connection
    ///
    /// # Returns
    ///
    /// `Ok(())` once every address was visited, whatever the per-address
    /// outcomes. [`FanrpcError::NoConnectionFound`] when nothing is
    /// registered, or the cancellation or deadline error of `ctx`.
    pub async fn range<F, Fut>(&self, ctx: &Context, f: F) -> Result<()>
    where
        F: Fn(Context, String, <D::Handle as ConnectionHandle>::Conn) -> Fut + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        let entries = self.registered()?;
        self.sweep(ctx, entries, &f).await
    }

    /// Like [`range`](Self::range), with at most `n` calls in flight. `n == 0`
    /// means no limit, `n == 1` is exactly [`range`](Self::range).
    ///
    /// A cancelled or timed out call cancels the calls still in flight.
    pub async fn range_concurrent<F, Fut>(&self, ctx: &Context, n: usize, f: F) -> Result<()>
    where
        F: Fn(Context, String, <D::Handle as ConnectionHandle>::Conn) -> Fut + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        if n == 1 {
            return self.range(ctx, f).await;
        }
        let entries = self.registered()?;
        self.sweep_concurrent(ctx, entries, n, &f).await
    }

    /// Like [`range`](Self::range), visiting `order` instead of the whole
    /// registry.
    ///
    /// Addresses without a registered handle are skipped and queued for a
    /// reconnect. Fails with [`FanrpcError::NoConnectionFound`] when none of
    /// them is registered.
    pub async fn ordered_range<S, F, Fut>(&self, ctx: &Context, order: &[S], f: F) -> Result<()>
    where
        S: AsRef<str>,
        F: Fn(Context, String, <D::Handle as ConnectionHandle>::Conn) -> Fut + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        let entries = self.ordered(order)?;
        self.sweep(ctx, entries, &f).await
    }

    /// [`ordered_range`](Self::ordered_range) with at most `n` calls in
    /// flight.
    pub async fn ordered_range_concurrent<S, F, Fut>(
        &self,
        ctx: &Context,
        order: &[S],
        n: usize,
        f: F,
    ) -> Result<()>
    where
        S: AsRef<str>,
        F: Fn(Context, String, <D::Handle as ConnectionHandle>::Conn) -> Fut + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        let entries = self.ordered(order)?;
        if n == 1 {
            return self.sweep(ctx, entries, &f).await;
        }
        self.sweep_concurrent(ctx, entries, n, &f).await
    }

    /// Tries registered addresses one by one until a call succeeds and
    /// returns its result.
    ///
    /// Each sweep starts one address further than the previous one. When a
    /// sweep fails with retryable errors and a backoff policy is configured,
    /// the whole sweep is retried under it.
    pub async fn round_robin<T, F, Fut>(&self, ctx: &Context, f: F) -> Result<T>
    where
        T: Send,
        F: Fn(Context, <D::Handle as ConnectionHandle>::Conn) -> Fut + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let f = &f;
        match self.inner.backoff.as_deref() {
            Some(backoff) => {
                backoff
                    .run(ctx, |ctx| async move { self.round_robin_sweep(&ctx, f).await })
                    .await
            }
            None => self.round_robin_sweep(ctx, f).await.into_result(),
        }
    }

    async fn round_robin_sweep<T, F, Fut>(&self, ctx: &Context, f: &F) -> Attempt<T>
    where
        T: Send,
        F: Fn(Context, <D::Handle as ConnectionHandle>::Conn) -> Fut + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut entries = self.inner.registry.entries();
        if entries.is_empty() {
            return Attempt::Stop(FanrpcError::NoConnectionFound);
        }
        let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % entries.len();
        entries.rotate_left(start);

        let breaker = self.inner.breaker.as_deref();
        let mut errs = Vec::new();
        let mut retryable = false;
        for (addr, handle) in entries {
            let call_ctx = self.call_ctx(ctx);
            match retry::attempt(&call_ctx, &addr, handle.as_ref(), breaker, f).await {
                Attempt::Done(v) => return Attempt::Done(v),
                Attempt::Retry(err) => {
                    debug!(addr = %addr, error = %err, "round robin candidate failed");
                    retryable = true;
                    errs.push(err.at_addr(&addr));
                }
                Attempt::Stop(err) => {
                    if let Some(done) = ctx.err() {
                        return Attempt::Stop(done);
                    }
                    debug!(addr = %addr, error = %err, "round robin candidate failed");
                    errs.push(err.at_addr(&addr));
                }
            }
        }

        let err = FanrpcError::join(errs).unwrap_or(FanrpcError::NoConnectionFound);
        if retryable {
            Attempt::Retry(err)
        } else {
            Attempt::Stop(err)
        }
    }

    fn registered(&self) -> Result<Entries<D>> {
        let entries = self.inner.registry.entries();
        if entries.is_empty() {
            return Err(FanrpcError::NoConnectionFound);
        }
        Ok(entries)
    }

    fn ordered<S: AsRef<str>>(&self, order: &[S]) -> Result<Entries<D>> {
        let mut entries = Vec::with_capacity(order.len());
        for addr in order {
            let addr = addr.as_ref();
            match self.inner.registry.load(addr) {
                Some(handle) => entries.push((addr.to_string(), handle)),
                None => {
                    debug!(addr, "ordered address not connected, queued for reconnect");
                    self.inner.queue_reconnect(addr, false);
                }
            }
        }
        if entries.is_empty() {
            return Err(FanrpcError::NoConnectionFound);
        }
        Ok(entries)
    }

    async fn visit<F, Fut>(&self, ctx: &Context, addr: &str, handle: &Handle<D>, f: &F) -> Result<()>
    where
        F: Fn(Context, String, <D::Handle as ConnectionHandle>::Conn) -> Fut + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        let ctx = self.call_ctx(ctx);
        let call = |ctx: Context, conn| f(ctx, addr.to_string(), conn);
        retry::execute(&ctx, addr, handle, self.policies(), &call).await
    }

    async fn sweep<F, Fut>(&self, ctx: &Context, entries: Entries<D>, f: &F) -> Result<()>
    where
        F: Fn(Context, String, <D::Handle as ConnectionHandle>::Conn) -> Fut + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        let mut errs = Vec::new();
        for (addr, handle) in entries {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            if let Err(err) = self.visit(ctx, &addr, &handle, f).await {
                // only the caller's own context ends the sweep
                if let Some(done) = ctx.err() {
                    return Err(done);
                }
                errs.push(err);
            }
        }
        finish(errs);
        Ok(())
    }

    async fn sweep_concurrent<F, Fut>(
        &self,
        ctx: &Context,
        entries: Entries<D>,
        n: usize,
        f: &F,
    ) -> Result<()>
    where
        F: Fn(Context, String, <D::Handle as ConnectionHandle>::Conn) -> Fut + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        let scope = ctx.child();
        let errs = Mutex::new(Vec::new());
        let limit = if n == 0 { None } else { Some(n) };

        let res = stream::iter(entries)
            .map(Ok::<_, FanrpcError>)
            .try_for_each_concurrent(limit, |(addr, handle)| {
                let (scope, errs) = (&scope, &errs);
                async move {
                    match self.visit(scope, &addr, &handle, f).await {
                        Ok(()) => Ok(()),
                        Err(err) if err.is_canceled_or_deadline() => {
                            scope.cancel();
                            Err(err)
                        }
                        Err(err) => {
                            errs.lock().unwrap_or_else(PoisonError::into_inner).push(err);
                            Ok(())
                        }
                    }
                }
            })
            .await;

        res?;
        finish(errs.into_inner().unwrap_or_else(PoisonError::into_inner));
        Ok(())
    }
}

/// Logs per-address failures of a sweep as one warning.
fn finish(errs: Vec<FanrpcError>) {
    let failed = errs.len();
    if let Some(err) = FanrpcError::join(errs) {
        warn!(failed, error = %err, "calls failed during range");
    }
}
