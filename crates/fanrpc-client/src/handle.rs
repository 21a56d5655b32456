use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use fanrpc_common::{Context, Result};

use crate::config::DialOptions;

/// Per-address connection handle.
///
/// A handle owns whatever transport state is needed to reach one address
/// (usually a small pool of connections). The client never dials on its own;
/// it only drives handles through this contract.
#[async_trait]
pub trait ConnectionHandle: fmt::Display + Send + Sync + 'static {
    /// What a dispatched call receives to talk to the peer.
    type Conn: Send;

    /// Brings the handle up, or tops it up to its configured size when it is
    /// already partially connected.
    async fn connect(&self, ctx: &Context) -> Result<()>;

    /// Repairs broken connections. With `force` every connection is
    /// re-established, healthy or not.
    async fn reconnect(&self, ctx: &Context, force: bool) -> Result<()>;

    /// Closes every connection. The handle is not used again afterwards.
    async fn disconnect(&self, ctx: &Context) -> Result<()>;

    /// Whether at least one connection can serve calls.
    async fn is_healthy(&self, ctx: &Context) -> bool;

    /// Whether the handle was dialed against a literal IP address.
    fn is_ip_conn(&self) -> bool;

    /// The address the handle was created for.
    fn addr(&self) -> &str;

    /// Executes `f` with one of the handle's connections.
    async fn run<T, F, Fut>(&self, ctx: &Context, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(Self::Conn) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send;
}

/// Builds handles for addresses.
pub trait Dialer: Send + Sync + 'static {
    type Handle: ConnectionHandle;

    /// Creates a handle for `addr`. The handle is not connected yet.
    fn new_handle(&self, addr: &str, opts: &DialOptions) -> Result<Self::Handle>;
}
