//! Background health and rebalance monitor.
//!
//! One task per client. Every health tick it checks each registered handle
//! and repairs unhealthy ones in place; every rebalance tick (when enabled)
//! it also tops up healthy ones. Addresses that could not be repaired are
//! queued as pending reconnects and retried after the tick under a budget of
//! the shorter tick interval. Addresses that still fail are bulk
//! disconnected, unless they are DNS names.

use std::sync::Arc;

use fanrpc_common::{Context, FanrpcError, Result};
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backoff::Attempt;
use crate::client::Inner;
use crate::handle::{ConnectionHandle, Dialer};
use crate::net::{addr_kind, AddrKind};

/// Errors reported by a running monitor.
///
/// Several receivers may exist for one monitor; each sees the errors sent
/// after it was created. The stream ends once the monitor stops.
pub struct ErrorStream {
    rx: broadcast::Receiver<FanrpcError>,
}

impl ErrorStream {
    pub(crate) fn new(rx: broadcast::Receiver<FanrpcError>) -> Self {
        Self { rx }
    }

    /// Next error, or `None` once the monitor has stopped. Errors dropped
    /// because the receiver fell behind are skipped.
    pub async fn recv(&mut self) -> Option<FanrpcError> {
        loop {
            match self.rx.recv().await {
                Ok(err) => return Some(err),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "error stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// An already queued error, without waiting.
    pub fn try_recv(&mut self) -> Option<FanrpcError> {
        loop {
            match self.rx.try_recv() {
                Ok(err) => return Some(err),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Health,
    Rebalance,
}

pub(crate) struct Monitor<D: Dialer> {
    inner: Arc<Inner<D>>,
    errors: broadcast::Sender<FanrpcError>,
    ctx: Context,
}

impl<D: Dialer> Monitor<D> {
    pub fn new(inner: Arc<Inner<D>>, errors: broadcast::Sender<FanrpcError>, ctx: Context) -> Self {
        Self { inner, errors, ctx }
    }

    /// Logs transient errors, pushes everything else to the error stream.
    fn report(&self, err: FanrpcError) {
        if err.is_transient() {
            warn!(error = %err, "transient connection error");
        } else {
            error!(error = %err, "connection error");
            let _ = self.errors.send(err);
        }
    }

    fn attempt_ctx(&self, parent: &Context) -> Context {
        parent.with_timeout(self.inner.config.min_connect_timeout())
    }

    /// Connects every configured address once.
    pub async fn initial_connect(&self) -> Result<()> {
        let addrs = &self.inner.config.addrs;
        info!(addrs = addrs.len(), "starting connection monitor");

        let results = join_all(addrs.iter().map(|addr| async move {
            let ctx = self.attempt_ctx(&self.ctx);
            (addr, self.inner.connect(&ctx, addr, None).await)
        }))
        .await;
        for (addr, res) in results {
            if let Err(err) = res {
                self.report(err);
                self.inner.queue_reconnect(addr, true);
            }
        }

        if self.inner.live() == 0 && !addrs.is_empty() {
            error!(addrs = ?addrs, "no connections available");
            return Err(FanrpcError::NoConnections(addrs.clone()));
        }
        info!(
            connected = self.inner.live(),
            addrs = addrs.len(),
            "initial connect finished"
        );
        Ok(())
    }

    /// Starts the monitor task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Main monitor loop
    async fn run(self) {
        let config = &self.inner.config;
        let health_every = config.health_check_interval();
        let rebalance_every = config.rebalance_interval();
        let rebalance_enabled = config.enable_rebalance;

        let mut health = interval_at(Instant::now() + health_every, health_every);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rebalance = interval_at(Instant::now() + rebalance_every, rebalance_every);
        rebalance.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            health_check_ms = health_every.as_millis() as u64,
            rebalance = rebalance_enabled,
            "connection monitor running"
        );

        loop {
            let tick = tokio::select! {
                _ = self.ctx.done() => break,
                _ = health.tick() => Tick::Health,
                _ = rebalance.tick(), if rebalance_enabled => Tick::Rebalance,
            };
            self.on_tick(tick).await;
        }

        info!("connection monitor stopped");
        let Monitor { inner, errors, .. } = self;
        drop(errors);
        let ctx = Context::background().with_timeout(inner.config.min_connect_timeout());
        if let Err(err) = inner.close(&ctx).await {
            warn!(error = %err, "failed to close client after monitor stopped");
        }
    }

    async fn on_tick(&self, tick: Tick) {
        debug!(?tick, "monitor tick");
        match tick {
            Tick::Health => self.check_health().await,
            Tick::Rebalance => self.rebalance().await,
        }
        let targets = self.drain_pending().await;
        self.bulk_disconnect(targets).await;
    }

    /// Repairs unhealthy handles in place, queueing the ones that stay
    /// broken.
    async fn check_health(&self) {
        let unhealthy: Vec<String> = {
            let checks = self.inner.registry.entries().into_iter().map(|(addr, handle)| {
                let ctx = self.attempt_ctx(&self.ctx);
                async move {
                    let healthy = handle.is_healthy(&ctx).await;
                    (addr, healthy)
                }
            });
            join_all(checks)
                .await
                .into_iter()
                .filter(|(_, healthy)| !healthy)
                .map(|(addr, _)| addr)
                .collect()
        };
        self.refresh_all(unhealthy, false).await;
    }

    /// Re-validates every registered handle, healthy or not.
    async fn rebalance(&self) {
        self.refresh_all(self.inner.registry.keys(), true).await;
    }

    async fn refresh_all(&self, addrs: Vec<String>, revalidate: bool) {
        let results = join_all(addrs.into_iter().map(|addr| async move {
            let ctx = self.attempt_ctx(&self.ctx);
            let res = self.inner.refresh(&ctx, &addr, revalidate).await;
            (addr, res)
        }))
        .await;
        for (addr, res) in results {
            match res {
                Ok(()) => {}
                // disconnected meanwhile
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(addr = %addr, error = %err, "connection unhealthy, queued for reconnect");
                    self.inner.queue_reconnect(&addr, true);
                }
            }
        }
    }

    /// Reconnects every pending address under the reconnect budget.
    ///
    /// Returns the addresses that are still broken. Attempts cut short by the
    /// budget are queued again for the next tick.
    async fn drain_pending(&self) -> Vec<String> {
        let pending = self.inner.take_pending();
        if pending.is_empty() {
            return Vec::new();
        }
        let budget = self.ctx.with_timeout(self.inner.config.reconnect_budget());
        debug!(pending = pending.len(), "draining pending reconnects");

        let results = join_all(pending.into_iter().map(|(addr, use_backoff)| {
            let budget = &budget;
            async move {
                let res = self.reconnect(budget, &addr, use_backoff).await;
                (addr, use_backoff, res)
            }
        }))
        .await;

        let mut broken = Vec::new();
        for (addr, use_backoff, res) in results {
            let Err(err) = res else {
                continue;
            };
            if budget.is_done() && err.is_canceled_or_deadline() {
                if self.ctx.is_done() {
                    continue;
                }
                debug!(addr = %addr, "reconnect budget exhausted, retrying next tick");
                self.inner.queue_reconnect(&addr, use_backoff);
                continue;
            }
            self.report(err);
            if self.inner.registry.load(&addr).is_none() {
                // never connected, keep trying
                self.inner.queue_reconnect(&addr, true);
            } else {
                broken.push(addr);
            }
        }
        broken
    }

    async fn reconnect(&self, budget: &Context, addr: &str, use_backoff: bool) -> Result<()> {
        let backoff = self.inner.backoff.as_deref().filter(|_| use_backoff);
        match backoff {
            Some(backoff) => {
                backoff
                    .run(budget, |budget| async move {
                        let ctx = self.attempt_ctx(&budget);
                        match self.inner.connect(&ctx, addr, None).await {
                            Ok(_) => Attempt::Done(()),
                            Err(err) if budget.is_done() => Attempt::Stop(err),
                            Err(err) => Attempt::Retry(err),
                        }
                    })
                    .await
            }
            None => {
                let ctx = self.attempt_ctx(budget);
                self.inner.connect(&ctx, addr, None).await.map(|_| ())
            }
        }
    }

    /// Disconnects broken addresses that name a literal IP. DNS names stay
    /// registered so resolver hiccups don't churn the registry; anything
    /// that does not parse is disconnected.
    async fn bulk_disconnect(&self, addrs: Vec<String>) {
        let targets: Vec<String> = addrs
            .into_iter()
            .filter(|addr| match addr_kind(addr) {
                AddrKind::Dns => {
                    debug!(addr = %addr, "keeping unhealthy DNS address registered");
                    false
                }
                AddrKind::Ip | AddrKind::Invalid => true,
            })
            .collect();
        if targets.is_empty() {
            return;
        }

        let results = join_all(targets.iter().map(|addr| {
            let ctx = self.attempt_ctx(&self.ctx);
            async move { self.inner.disconnect(&ctx, addr).await }
        }))
        .await;
        for (addr, res) in targets.iter().zip(results) {
            match res {
                Ok(()) => info!(addr = %addr, "disconnected unreachable address"),
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(addr = %addr, error = %err, "failed to disconnect"),
            }
        }
    }
}
