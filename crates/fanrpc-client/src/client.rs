use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fanrpc_common::{Context, FanrpcError, Result};
use futures::future::{join_all, FutureExt};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{ClientConfig, DialOptions, ReplacePolicy};
use crate::handle::{ConnectionHandle, Dialer};
use crate::monitor::{ErrorStream, Monitor};
use crate::registry::Registry;
use crate::retry::Policies;
use crate::singleflight::SingleFlight;

pub(crate) type Handle<D> = <D as Dialer>::Handle;

/// Resilient fan-out RPC client.
///
/// The client keeps one [`ConnectionHandle`] per target address in a
/// concurrent [`Registry`], keeps them healthy from a background monitor
/// (see [`start_connection_monitor`](Self::start_connection_monitor)), and
/// dispatches calls over them with one of several strategies
/// ([`call`](Self::call), [`range`](Self::range),
/// [`round_robin`](Self::round_robin), ...).
///
/// Cloning is cheap; clones share the same registry and monitor.
///
/// # Example
///
/// ```rust,no_run
/// use fanrpc_client::{Client, ClientConfig, ExponentialBackoff, TcpDialer};
/// use fanrpc_common::Context;
///
/// # #[tokio::main]
/// # async fn main() -> fanrpc_common::Result<()> {
/// let config = ClientConfig::new(["10.0.0.1:8081", "10.0.0.2:8081"]);
/// let client = Client::builder(TcpDialer, config)
///     .with_backoff(ExponentialBackoff::default())
///     .build();
///
/// let ctx = Context::background();
/// let mut errors = client.start_connection_monitor(&ctx).await?;
/// tokio::spawn(async move {
///     while let Some(err) = errors.recv().await {
///         eprintln!("monitor: {}", err);
///     }
/// });
///
/// client
///     .range(&ctx.with_method("search"), |_ctx, addr, _conn| async move {
///         println!("visited {}", addr);
///         Ok(())
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Client<D: Dialer> {
    pub(crate) inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Default)]
pub(crate) struct MonitorState {
    pub ctx: Option<Context>,
    pub errors: Option<broadcast::Sender<FanrpcError>>,
}

pub(crate) struct Inner<D: Dialer> {
    pub dialer: D,
    pub config: ClientConfig,
    pub registry: Registry<Handle<D>>,
    pub backoff: Option<Arc<dyn Backoff>>,
    pub breaker: Option<Arc<dyn CircuitBreaker>>,
    resolve_dns: Mutex<HashMap<String, bool>>,
    /// address -> use backoff on the next attempt
    pending: Mutex<HashMap<String, bool>>,
    live: AtomicUsize,
    closed: AtomicBool,
    /// Cancelled by close, cuts short the drain of replaced handles
    shutdown: Context,
    /// Replaced handles waiting to be closed
    retiring: Mutex<JoinSet<()>>,
    /// Start offset of the next round-robin sweep
    pub cursor: AtomicUsize,
    connect_flight: SingleFlight<Result<Arc<Handle<D>>>>,
    disconnect_flight: SingleFlight<Result<()>>,
    pub monitor: Mutex<MonitorState>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds a [`Client`].
///
/// Obtained from [`Client::builder`]. Policies are optional: a client
/// without a backoff gives each call a single attempt, and one without a
/// circuit breaker never fails fast.
///
/// # Fields
///
/// - `dialer`: Creates a handle for every address the client connects to
/// - `config`: Addresses, monitor intervals and dial / call options
/// - `backoff`: Retry policy shared by every dispatched call
/// - `breaker`: Circuit breaker shared by every dispatched call
/// - `resolve_dns`: Per-address overrides of [`DialOptions::resolve_dns`]
pub struct ClientBuilder<D: Dialer> {
    dialer: D,
    config: ClientConfig,
    backoff: Option<Arc<dyn Backoff>>,
    breaker: Option<Arc<dyn CircuitBreaker>>,
    resolve_dns: HashMap<String, bool>,
}

impl<D: Dialer> ClientBuilder<D> {
    /// Retries every dispatched call under `backoff`. Without one each call
    /// gets a single attempt.
    pub fn with_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Some(Arc::new(backoff));
        self
    }

    /// Puts every dispatched call whose context names a method behind
    /// `breaker`.
    pub fn with_circuit_breaker(mut self, breaker: impl CircuitBreaker + 'static) -> Self {
        self.breaker = Some(Arc::new(breaker));
        self
    }

    /// Overrides [`DialOptions::resolve_dns`] for one address.
    pub fn with_resolve_dns(mut self, addr: impl Into<String>, resolve: bool) -> Self {
        self.resolve_dns.insert(addr.into(), resolve);
        self
    }

    /// Finishes the builder.
    ///
    /// The returned client holds no connections yet. Call
    /// [`Client::start_connection_monitor`] to dial every configured address,
    /// or [`Client::connect`] for single addresses.
    pub fn build(self) -> Client<D> {
        Client {
            inner: Arc::new(Inner {
                dialer: self.dialer,
                config: self.config,
                registry: Registry::new(),
                backoff: self.backoff,
                breaker: self.breaker,
                resolve_dns: Mutex::new(self.resolve_dns),
                pending: Mutex::new(HashMap::new()),
                live: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                shutdown: Context::background(),
                retiring: Mutex::new(JoinSet::new()),
                cursor: AtomicUsize::new(0),
                connect_flight: SingleFlight::new(),
                disconnect_flight: SingleFlight::new(),
                monitor: Mutex::new(MonitorState::default()),
            }),
        }
    }
}

impl<D: Dialer> Client<D> {
    /// Creates a client without retry or circuit-breaking policies.
    ///
    /// # Arguments
    ///
    /// - `dialer`: Creates the per-address connection handles
    /// - `config`: Client configuration, see [`ClientConfig`]
    pub fn new(dialer: D, config: ClientConfig) -> Self {
        Self::builder(dialer, config).build()
    }

    /// Starts a [`ClientBuilder`] for a client with policies or DNS
    /// overrides.
    pub fn builder(dialer: D, config: ClientConfig) -> ClientBuilder<D> {
        ClientBuilder {
            dialer,
            config,
            backoff: None,
            breaker: None,
            resolve_dns: HashMap::new(),
        }
    }

    /// The configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The configured target addresses.
    pub fn addrs(&self) -> &[String] {
        &self.inner.config.addrs
    }

    /// Addresses that currently have a registered handle, sorted.
    pub fn connected_addrs(&self) -> Vec<String> {
        self.inner.registry.keys()
    }

    /// Number of addresses holding a handle.
    pub fn live_connections(&self) -> usize {
        self.inner.live()
    }

    /// Whether the connection monitor is running.
    ///
    /// # Returns
    ///
    /// `true` between a successful
    /// [`start_connection_monitor`](Self::start_connection_monitor) and the
    /// cancellation of its context or a [`close`](Self::close).
    pub fn is_running(&self) -> bool {
        lock(&self.inner.monitor).errors.is_some()
    }

    /// Whether the client was closed. A closed client stays closed; every
    /// later connect fails with [`FanrpcError::ClientClosed`].
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Overrides DNS resolution for handles created for `addr` from now on.
    pub fn set_resolve_dns(&self, addr: impl Into<String>, resolve: bool) {
        lock(&self.inner.resolve_dns).insert(addr.into(), resolve);
    }

    /// Addresses queued for a reconnect on the next monitor tick.
    pub fn pending_reconnects(&self) -> Vec<String> {
        let mut addrs: Vec<String> = lock(&self.inner.pending).keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Returns a healthy handle for `addr`, dialing one if needed.
    ///
    /// Concurrent calls for the same address share a single execution and
    /// all observe its result.
    ///
    /// # Implementation Details
    ///
    /// - A healthy registered handle is returned as is
    /// - An unhealthy one is first repaired in place
    /// - Only when that fails a new handle is dialed and stored; the old
    ///   handle stays registered if the dial fails
    /// - A replaced handle is closed in the background according to
    ///   [`ReplacePolicy`]
    ///
    /// # Returns
    ///
    /// The registered handle, [`FanrpcError::ClientClosed`] once the client
    /// is closed, or the dial error naming `addr`.
    pub async fn connect(&self, ctx: &Context, addr: &str) -> Result<Arc<D::Handle>> {
        self.inner.connect(ctx, addr, None).await
    }

    /// Like [`connect`](Self::connect), dialing new handles with `opts`
    /// instead of the configured defaults.
    pub async fn connect_with(
        &self,
        ctx: &Context,
        addr: &str,
        opts: DialOptions,
    ) -> Result<Arc<D::Handle>> {
        self.inner.connect(ctx, addr, Some(opts)).await
    }

    /// Removes `addr` from the registry and closes its handle. Returns
    /// [`FanrpcError::ConnectionNotFound`] when nothing is registered.
    pub async fn disconnect(&self, ctx: &Context, addr: &str) -> Result<()> {
        self.inner.disconnect(ctx, addr).await
    }

    /// Whether `addr` has a registered handle that reports healthy.
    pub async fn is_connected(&self, ctx: &Context, addr: &str) -> bool {
        match self.inner.registry.load(addr) {
            Some(handle) => handle.is_healthy(ctx).await,
            None => false,
        }
    }

    /// Performs the initial connect to every configured address and starts
    /// the background monitor.
    ///
    /// Fails with [`FanrpcError::NoConnections`] when addresses are configured
    /// but none could be reached; the client is closed in that case and no
    /// monitor is started. Calling it while the monitor runs returns another
    /// receiver for the running monitor's error stream.
    pub async fn start_connection_monitor(&self, ctx: &Context) -> Result<ErrorStream> {
        let (errors, stream, monitor_ctx) = {
            let mut state = lock(&self.inner.monitor);
            if self.is_closed() {
                return Err(FanrpcError::ClientClosed);
            }
            if let Some(errors) = &state.errors {
                return Ok(ErrorStream::new(errors.subscribe()));
            }
            let (errors, stream) =
                broadcast::channel(self.inner.config.error_stream_capacity.max(1));
            let monitor_ctx = ctx.child();
            state.errors = Some(errors.clone());
            state.ctx = Some(monitor_ctx.clone());
            (errors, stream, monitor_ctx)
        };

        let monitor = Monitor::new(Arc::clone(&self.inner), errors, monitor_ctx);
        if let Err(err) = monitor.initial_connect().await {
            drop(monitor);
            self.inner.clear_monitor();
            if let Err(close_err) = self.inner.close(ctx).await {
                warn!(error = %close_err, "failed to close client after initial connect");
            }
            return Err(err);
        }
        monitor.spawn();
        Ok(ErrorStream::new(stream))
    }

    /// Stops the monitor and disconnects every registered address.
    ///
    /// Replaced handles still draining are closed right away, and a connect
    /// that finishes after the close drops its handle. Errors from single
    /// addresses are joined into one.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        self.inner.close(ctx).await
    }

    pub(crate) fn policies(&self) -> Policies<'_> {
        Policies {
            backoff: self.inner.backoff.as_deref(),
            breaker: self.inner.breaker.as_deref(),
        }
    }
}

impl<D: Dialer> Inner<D> {
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn queue_reconnect(&self, addr: &str, use_backoff: bool) {
        let mut pending = lock(&self.pending);
        let flag = pending.entry(addr.to_string()).or_insert(false);
        *flag |= use_backoff;
    }

    pub(crate) fn take_pending(&self) -> Vec<(String, bool)> {
        let mut addrs: Vec<(String, bool)> = lock(&self.pending).drain().collect();
        addrs.sort();
        addrs
    }

    pub(crate) fn clear_monitor(&self) {
        let mut state = lock(&self.monitor);
        state.errors = None;
        if let Some(ctx) = state.ctx.take() {
            ctx.cancel();
        }
    }

    /// Stores `handle`, keeping the live counter in step with the registry.
    fn store(&self, addr: &str, handle: Arc<Handle<D>>) -> Option<Arc<Handle<D>>> {
        let prev = self.registry.swap(addr, handle);
        if prev.is_none() {
            self.live.fetch_add(1, Ordering::AcqRel);
        }
        prev
    }

    fn remove(&self, addr: &str) -> Option<Arc<Handle<D>>> {
        let prev = self.registry.delete(addr);
        if prev.is_some() {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        prev
    }

    fn dial_options(&self, addr: &str, overrides: Option<DialOptions>) -> DialOptions {
        let mut opts = overrides.unwrap_or_else(|| self.config.dial.clone());
        if let Some(resolve) = lock(&self.resolve_dns).get(addr) {
            opts.resolve_dns = *resolve;
        }
        opts
    }

    pub(crate) async fn connect(
        self: &Arc<Self>,
        ctx: &Context,
        addr: &str,
        opts: Option<DialOptions>,
    ) -> Result<Arc<Handle<D>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FanrpcError::ClientClosed);
        }
        let inner = Arc::clone(self);
        let flight_ctx = ctx.clone();
        let key = addr.to_string();
        let (res, shared) = self
            .connect_flight
            .run(addr, move || {
                async move { inner.connect_once(&flight_ctx, &key, opts).await }.boxed()
            })
            .await;
        if shared {
            debug!(addr, "joined in-flight connect");
        }
        res
    }

    async fn connect_once(
        &self,
        ctx: &Context,
        addr: &str,
        opts: Option<DialOptions>,
    ) -> Result<Arc<Handle<D>>> {
        if let Some(existing) = self.registry.load(addr) {
            if existing.is_healthy(ctx).await {
                debug!(addr, "reusing healthy connection");
                return Ok(existing);
            }
            match existing.reconnect(ctx, false).await {
                Ok(()) => {
                    if existing.is_healthy(ctx).await {
                        debug!(addr, "reconnected existing handle");
                        if let Some(prev) = self.publish(ctx, addr, &existing).await? {
                            self.retire(ctx, prev).await;
                        }
                        return Ok(existing);
                    }
                    debug!(addr, "handle still unhealthy after reconnect");
                }
                Err(err) => debug!(addr, error = %err, "reconnect failed, dialing new handle"),
            }
        }

        let opts = self.dial_options(addr, opts);
        let handle = Arc::new(
            self.dialer
                .new_handle(addr, &opts)
                .map_err(|err| err.at_addr(addr))?,
        );
        if let Err(err) = bring_up(ctx, handle.as_ref()).await {
            let cleanup = handle.disconnect(ctx).await.err();
            let err = FanrpcError::join(std::iter::once(err).chain(cleanup)).unwrap_or_else(|| {
                FanrpcError::Unhealthy(addr.to_string())
            });
            return Err(err.at_addr(addr));
        }

        match self.publish(ctx, addr, &handle).await? {
            Some(prev) => {
                info!(addr, "replaced connection");
                self.retire(ctx, prev).await;
            }
            None => info!(addr, "connected"),
        }
        Ok(handle)
    }

    /// Stores `handle` for `addr` and returns the different handle it
    /// replaced, if any.
    ///
    /// A close that ran while the handle was being dialed only saw the
    /// registry as it was before the store. In that case the entry is taken
    /// out again, both handles are disconnected and
    /// [`FanrpcError::ClientClosed`] is returned.
    async fn publish(
        &self,
        ctx: &Context,
        addr: &str,
        handle: &Arc<Handle<D>>,
    ) -> Result<Option<Arc<Handle<D>>>> {
        let prev = self
            .store(addr, Arc::clone(handle))
            .filter(|prev| !Arc::ptr_eq(prev, handle));
        if !self.closed.load(Ordering::SeqCst) {
            return Ok(prev);
        }

        debug!(addr, "client closed while connecting, dropping handle");
        let stale = self.remove(addr).into_iter().chain(prev);
        for stale in stale {
            if let Err(err) = stale.disconnect(ctx).await {
                warn!(addr, error = %err, "failed to close handle after client closed");
            }
        }
        Err(FanrpcError::ClientClosed)
    }

    /// Repairs the registered handle for `addr` in place without dialing a
    /// new one. With `revalidate` a healthy handle is also topped up through
    /// a lightweight connect.
    ///
    /// Shares the per-address critical section with [`connect`](Self::connect).
    pub(crate) async fn refresh(
        self: &Arc<Self>,
        ctx: &Context,
        addr: &str,
        revalidate: bool,
    ) -> Result<()> {
        let inner = Arc::clone(self);
        let flight_ctx = ctx.clone();
        let key = addr.to_string();
        let (res, _) = self
            .connect_flight
            .run(addr, move || {
                async move { inner.refresh_once(&flight_ctx, &key, revalidate).await }.boxed()
            })
            .await;
        res.map(|_| ())
    }

    async fn refresh_once(
        &self,
        ctx: &Context,
        addr: &str,
        revalidate: bool,
    ) -> Result<Arc<Handle<D>>> {
        let Some(handle) = self.registry.load(addr) else {
            return Err(FanrpcError::ConnectionNotFound(addr.to_string()));
        };
        if handle.is_healthy(ctx).await {
            if revalidate {
                handle.connect(ctx).await.map_err(|err| err.at_addr(addr))?;
            }
            return Ok(handle);
        }
        handle
            .reconnect(ctx, false)
            .await
            .map_err(|err| err.at_addr(addr))?;
        if !handle.is_healthy(ctx).await {
            return Err(FanrpcError::Unhealthy(addr.to_string()));
        }
        debug!(addr, "repaired unhealthy connection");
        Ok(handle)
    }

    /// Closes a handle that was just replaced in the registry.
    ///
    /// With [`ReplacePolicy::DrainThenClose`] the drain runs as a background
    /// task so the per-address critical section is released right away.
    /// Close cuts the drain short and waits for every retirement to finish.
    async fn retire(&self, ctx: &Context, prev: Arc<Handle<D>>) {
        let timeout_ms = match self.config.replace_policy {
            ReplacePolicy::CloseImmediately => {
                if let Err(err) = prev.disconnect(ctx).await {
                    warn!(addr = prev.addr(), error = %err, "failed to close replaced handle");
                }
                return;
            }
            ReplacePolicy::DrainThenClose { timeout_ms } => timeout_ms,
        };
        let shutdown = self.shutdown.clone();
        let disconnect_timeout = self.config.min_connect_timeout();

        let mut retiring = lock(&self.retiring);
        // reap retirements that already finished
        while retiring.try_join_next().is_some() {}
        retiring.spawn(async move {
            tokio::select! {
                drained = drain(&prev, Duration::from_millis(timeout_ms)) => {
                    if !drained {
                        warn!(
                            addr = prev.addr(),
                            timeout_ms, "replaced handle still in use, closing anyway"
                        );
                    }
                }
                _ = shutdown.done() => {
                    debug!(addr = prev.addr(), "client closing, closing replaced handle");
                }
            }
            let ctx = Context::background().with_timeout(disconnect_timeout);
            if let Err(err) = prev.disconnect(&ctx).await {
                warn!(addr = prev.addr(), error = %err, "failed to close replaced handle");
            }
        });
    }

    pub(crate) async fn disconnect(self: &Arc<Self>, ctx: &Context, addr: &str) -> Result<()> {
        let inner = Arc::clone(self);
        let flight_ctx = ctx.clone();
        let key = addr.to_string();
        let (res, _) = self
            .disconnect_flight
            .run(addr, move || {
                async move { inner.disconnect_once(&flight_ctx, &key).await }.boxed()
            })
            .await;
        res
    }

    async fn disconnect_once(&self, ctx: &Context, addr: &str) -> Result<()> {
        let Some(handle) = self.remove(addr) else {
            return Err(FanrpcError::ConnectionNotFound(addr.to_string()));
        };
        debug!(addr, "disconnecting");
        handle.disconnect(ctx).await.map_err(|err| err.at_addr(addr))
    }

    pub(crate) async fn close(self: &Arc<Self>, ctx: &Context) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.clear_monitor();
        lock(&self.pending).clear();

        let addrs = self.registry.keys();
        let results = join_all(addrs.iter().map(|addr| self.disconnect(ctx, addr))).await;

        self.shutdown.cancel();
        let mut retiring = std::mem::take(&mut *lock(&self.retiring));
        while retiring.join_next().await.is_some() {}
        let errs = results
            .into_iter()
            .filter_map(|r| r.err())
            .filter(|err| !err.is_not_found());
        match FanrpcError::join(errs) {
            Some(err) => {
                warn!(error = %err, "errors while closing client");
                Err(err)
            }
            None => {
                info!(closed = addrs.len(), "client closed");
                Ok(())
            }
        }
    }
}

async fn bring_up<H: ConnectionHandle>(ctx: &Context, handle: &H) -> Result<()> {
    handle.connect(ctx).await?;
    if !handle.is_healthy(ctx).await {
        return Err(FanrpcError::Unhealthy(handle.addr().to_string()));
    }
    Ok(())
}

/// Waits until nobody but the caller holds `handle`, polling every 10ms.
async fn drain<H>(handle: &Arc<H>, timeout: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while Arc::strong_count(handle) > 1 {
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}
