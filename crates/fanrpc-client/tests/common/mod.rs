//! Shared test fixtures: an in-memory dialer whose handles can be taken
//! down, broken and inspected from the test.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fanrpc_client::{addr_kind, AddrKind, ConnectionHandle, DialOptions, Dialer};
use fanrpc_common::{Context, FanrpcError, Result};

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Polls `cond` every 10ms, up to one second.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[derive(Debug, Default)]
pub struct HandleState {
    pub healthy: AtomicBool,
    /// Reconnects fail and the handle reports unhealthy for good
    pub broken: AtomicBool,
    pub disconnected: AtomicBool,
    pub connects: AtomicUsize,
    pub calls: AtomicUsize,
}

#[derive(Debug, Default)]
pub struct MockState {
    dials: Mutex<HashMap<String, usize>>,
    down: Mutex<HashSet<String>>,
    handles: Mutex<Vec<(String, Arc<HandleState>)>>,
    last_opts: Mutex<HashMap<String, DialOptions>>,
    dial_delay: Mutex<Duration>,
    next_id: AtomicUsize,
}

impl MockState {
    /// Handles created for `addr`.
    pub fn dials(&self, addr: &str) -> usize {
        self.dials.lock().unwrap().get(addr).copied().unwrap_or(0)
    }

    pub fn total_dials(&self) -> usize {
        self.dials.lock().unwrap().values().sum()
    }

    /// A down address refuses new connections and its handles report
    /// unhealthy.
    pub fn set_down(&self, addr: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(addr.to_string());
        } else {
            set.remove(addr);
        }
    }

    pub fn is_down(&self, addr: &str) -> bool {
        self.down.lock().unwrap().contains(addr)
    }

    /// Breaks every handle created so far for `addr`.
    pub fn break_handles(&self, addr: &str) {
        for (a, h) in self.handles.lock().unwrap().iter() {
            if a == addr {
                h.broken.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn handles(&self, addr: &str) -> Vec<Arc<HandleState>> {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == addr)
            .map(|(_, h)| h.clone())
            .collect()
    }

    pub fn last_opts(&self, addr: &str) -> Option<DialOptions> {
        self.last_opts.lock().unwrap().get(addr).cloned()
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        *self.dial_delay.lock().unwrap() = delay;
    }
}

#[derive(Clone, Default)]
pub struct MockDialer {
    pub state: Arc<MockState>,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dialer for MockDialer {
    type Handle = MockHandle;

    fn new_handle(&self, addr: &str, opts: &DialOptions) -> Result<MockHandle> {
        if addr_kind(addr) == AddrKind::Invalid {
            return Err(FanrpcError::InvalidAddress(addr.to_string()));
        }
        *self
            .state
            .dials
            .lock()
            .unwrap()
            .entry(addr.to_string())
            .or_insert(0) += 1;
        self.state
            .last_opts
            .lock()
            .unwrap()
            .insert(addr.to_string(), opts.clone());

        let handle = Arc::new(HandleState::default());
        self.state
            .handles
            .lock()
            .unwrap()
            .push((addr.to_string(), handle.clone()));
        Ok(MockHandle {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst),
            addr: addr.to_string(),
            handle,
            state: self.state.clone(),
        })
    }
}

/// What a dispatched call receives.
#[derive(Debug, Clone)]
pub struct MockConn {
    pub addr: String,
    pub handle_id: usize,
}

#[derive(Debug)]
pub struct MockHandle {
    pub id: usize,
    addr: String,
    pub handle: Arc<HandleState>,
    state: Arc<MockState>,
}

impl fmt::Display for MockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock#{}({})", self.id, self.addr)
    }
}

#[async_trait]
impl ConnectionHandle for MockHandle {
    type Conn = MockConn;

    async fn connect(&self, _ctx: &Context) -> Result<()> {
        self.handle.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.dial_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.is_down(&self.addr) {
            return Err(FanrpcError::Connection(format!("{} refused", self.addr)));
        }
        self.handle.healthy.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reconnect(&self, _ctx: &Context, _force: bool) -> Result<()> {
        if self.state.is_down(&self.addr) || self.handle.broken.load(Ordering::SeqCst) {
            return Err(FanrpcError::Connection(format!("{} refused", self.addr)));
        }
        self.handle.healthy.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self, _ctx: &Context) -> Result<()> {
        self.handle.healthy.store(false, Ordering::SeqCst);
        self.handle.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_healthy(&self, _ctx: &Context) -> bool {
        self.handle.healthy.load(Ordering::SeqCst)
            && !self.handle.broken.load(Ordering::SeqCst)
            && !self.state.is_down(&self.addr)
    }

    fn is_ip_conn(&self) -> bool {
        addr_kind(&self.addr) == AddrKind::Ip
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn run<T, F, Fut>(&self, _ctx: &Context, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(Self::Conn) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        self.handle.calls.fetch_add(1, Ordering::SeqCst);
        f(MockConn {
            addr: self.addr.clone(),
            handle_id: self.id,
        })
        .await
    }
}
