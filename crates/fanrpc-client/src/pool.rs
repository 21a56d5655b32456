use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use fanrpc_common::{Context, FanrpcError, Result};
use futures::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DialOptions;
use crate::handle::{ConnectionHandle, Dialer};
use crate::net::{addr_kind, AddrKind};

/// Pooled connection wrapper.
///
/// Wraps a TCP stream with the socket address it is connected to. The stream
/// is wrapped in an `Arc<Mutex<T>>` so a dispatched call can hold it across
/// awaits while the pool keeps its own reference.
///
/// # Fields
///
/// - `stream`: The TCP stream wrapped in an async mutex
/// - `addr`: The resolved socket address this connection is connected to
#[derive(Clone)]
pub struct PooledConnection {
    /// The TCP stream
    pub stream: Arc<Mutex<TcpStream>>,
    /// The address this connection is to
    pub addr: SocketAddr,
}

impl PooledConnection {
    /// Checks if the connection is still alive.
    ///
    /// # Implementation Details
    ///
    /// - If the stream lock is held by a call, the connection is in use and
    ///   counts as alive.
    /// - Otherwise the socket is peeked with a 1ms timeout. EOF or an I/O
    ///   error means the peer went away; a timeout means the socket is idle
    ///   and still open.
    pub async fn is_valid(&self) -> bool {
        let Ok(stream) = self.stream.try_lock() else {
            return true;
        };
        let mut buf = [0u8; 1];
        match tokio::time::timeout(
            std::time::Duration::from_millis(1),
            stream.peek(&mut buf),
        )
        .await
        {
            Ok(Ok(0)) => false, // peer closed
            Ok(Ok(_)) => true,  // unread data pending
            Ok(Err(_)) => false,
            Err(_) => true, // nothing to read, socket open
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("addr", &self.addr)
            .finish()
    }
}

/// Builds [`TcpPool`] handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    type Handle = TcpPool;

    fn new_handle(&self, addr: &str, opts: &DialOptions) -> Result<TcpPool> {
        TcpPool::new(addr, opts.clone())
    }
}

/// Fixed-size pool of TCP connections to one address.
///
/// The pool keeps `pool_size` slots. [`connect`](ConnectionHandle::connect)
/// and a non-forced [`reconnect`](ConnectionHandle::reconnect) dial the slots
/// that are empty or dead; a forced reconnect redials every slot. Calls get
/// slots in round-robin order.
///
/// # DNS
///
/// With `resolve_dns` on, a `host:port` address is resolved on every dial
/// round and the slots are spread over the resolved IPs. With it off, each
/// slot dials the name and lets the resolver pick.
///
/// # Example
///
/// ```rust,no_run
/// use fanrpc_client::{ConnectionHandle, DialOptions, TcpPool};
/// use fanrpc_common::Context;
///
/// # #[tokio::main]
/// # async fn main() -> fanrpc_common::Result<()> {
/// let pool = TcpPool::new("127.0.0.1:8081", DialOptions::default())?;
/// let ctx = Context::background();
/// pool.connect(&ctx).await?;
/// assert!(pool.is_healthy(&ctx).await);
/// # Ok(())
/// # }
/// ```
pub struct TcpPool {
    addr: String,
    kind: AddrKind,
    opts: DialOptions,
    slots: std::sync::Mutex<Vec<Option<PooledConnection>>>,
    next: AtomicUsize,
}

impl TcpPool {
    /// Creates an unconnected pool. Fails for addresses without a port or
    /// with a malformed host.
    pub fn new(addr: &str, opts: DialOptions) -> Result<Self> {
        let kind = addr_kind(addr);
        if kind == AddrKind::Invalid {
            return Err(FanrpcError::InvalidAddress(addr.to_string()));
        }
        let size = opts.pool_size.max(1);
        Ok(Self {
            addr: addr.to_string(),
            kind,
            opts,
            slots: std::sync::Mutex::new(vec![None; size]),
            next: AtomicUsize::new(0),
        })
    }

    pub fn options(&self) -> &DialOptions {
        &self.opts
    }

    /// Number of slots currently holding a connection.
    pub fn open_slots(&self) -> usize {
        self.snapshot().iter().filter(|s| s.is_some()).count()
    }

    fn snapshot(&self) -> Vec<Option<PooledConnection>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn targets(&self) -> Result<Vec<String>> {
        if self.kind == AddrKind::Dns && self.opts.resolve_dns {
            let resolved: Vec<String> = tokio::net::lookup_host(&self.addr)
                .await?
                .map(|a| a.to_string())
                .collect();
            if resolved.is_empty() {
                return Err(FanrpcError::Connection(format!(
                    "{} resolved to no addresses",
                    self.addr
                )));
            }
            return Ok(resolved);
        }
        Ok(vec![self.addr.clone()])
    }

    async fn dial(&self, target: &str) -> Result<PooledConnection> {
        let stream =
            tokio::time::timeout(self.opts.connect_timeout(), TcpStream::connect(target)).await??;
        stream.set_nodelay(true)?;
        let addr = stream.peer_addr()?;
        Ok(PooledConnection {
            stream: Arc::new(Mutex::new(stream)),
            addr,
        })
    }

    /// Dials every slot that needs it. Succeeds when at least one slot ends
    /// up holding a live connection.
    async fn fill(&self, ctx: &Context, force: bool) -> Result<()> {
        let current = self.snapshot();
        let mut wanted = Vec::new();
        for (i, slot) in current.iter().enumerate() {
            let alive = match slot {
                Some(conn) => !force && conn.is_valid().await,
                None => false,
            };
            if !alive {
                wanted.push(i);
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let targets = ctx.run(self.targets()).await?;
        let dials = wanted.iter().enumerate().map(|(n, &slot)| {
            let target = &targets[n % targets.len()];
            async move { (slot, ctx.run(self.dial(target)).await) }
        });
        let results = join_all(dials).await;

        let mut errs = Vec::new();
        let mut replaced = Vec::new();
        {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            for (slot, res) in results {
                match res {
                    Ok(conn) => {
                        if let Some(old) = slots[slot].replace(conn) {
                            replaced.push(old);
                        }
                    }
                    Err(err) => errs.push(err),
                }
            }
        }
        for old in replaced {
            shutdown(old).await;
        }

        let open = self.open_slots();
        debug!(
            addr = %self.addr,
            open,
            failed = errs.len(),
            "dialed pool slots"
        );
        match FanrpcError::join(errs) {
            Some(err) if open == 0 => Err(err),
            _ => Ok(()),
        }
    }
}

async fn shutdown(conn: PooledConnection) {
    if let Ok(mut stream) = conn.stream.try_lock() {
        let _ = stream.shutdown().await;
    }
}

impl fmt::Display for TcpPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.addr)
    }
}

impl fmt::Debug for TcpPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPool")
            .field("addr", &self.addr)
            .field("kind", &self.kind)
            .field("pool_size", &self.opts.pool_size)
            .finish()
    }
}

#[async_trait]
impl ConnectionHandle for TcpPool {
    type Conn = PooledConnection;

    async fn connect(&self, ctx: &Context) -> Result<()> {
        self.fill(ctx, false).await
    }

    async fn reconnect(&self, ctx: &Context, force: bool) -> Result<()> {
        self.fill(ctx, force).await
    }

    async fn disconnect(&self, _ctx: &Context) -> Result<()> {
        let taken: Vec<PooledConnection> = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.iter_mut().filter_map(Option::take).collect()
        };
        debug!(addr = %self.addr, closed = taken.len(), "disconnecting pool");
        for conn in taken {
            shutdown(conn).await;
        }
        Ok(())
    }

    async fn is_healthy(&self, _ctx: &Context) -> bool {
        for conn in self.snapshot().into_iter().flatten() {
            if conn.is_valid().await {
                return true;
            }
        }
        false
    }

    fn is_ip_conn(&self) -> bool {
        self.kind == AddrKind::Ip
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
        let conn = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let n = slots.len();
            let start = self.next.fetch_add(1, Ordering::Relaxed);
            (0..n).find_map(|i| slots[(start + i) % n].clone())
        };
        match conn {
            Some(conn) => f(conn).await,
            None => Err(FanrpcError::Unhealthy(self.addr.clone())),
        }
    }
}
