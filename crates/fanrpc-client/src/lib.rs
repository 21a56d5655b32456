//! fanrpc Client
//!
//! A resilient client for fanning RPCs out to a set of worker nodes.
//!
//! # Overview
//!
//! The client keeps one connection handle per target address and survives
//! partial outages, DNS flaps and transient RPC errors without surfacing
//! them as crashes:
//!
//! - **Registry**: read-mostly concurrent map from address to handle ([`Registry`])
//! - **Critical section**: at most one connect and one disconnect in flight
//!   per address ([`Client::connect`], [`Client::disconnect`])
//! - **Monitor**: background health checks, rebalancing and reconnects
//!   ([`Client::start_connection_monitor`])
//! - **Dispatch**: [`Client::call`], [`Client::range`],
//!   [`Client::range_concurrent`], [`Client::ordered_range`],
//!   [`Client::ordered_range_concurrent`], [`Client::round_robin`]
//! - **Retry and circuit breaking**: pluggable [`Backoff`] and
//!   [`CircuitBreaker`] policies
//!
//! Transport is abstracted behind [`ConnectionHandle`] and [`Dialer`];
//! [`TcpDialer`] provides pooled TCP connections.
//!
//! # Example
//!
//! ```no_run
//! use fanrpc_client::{Client, ClientConfig, ConsecutiveFailureBreaker, TcpDialer};
//! use fanrpc_common::Context;
//!
//! # #[tokio::main]
//! # async fn main() -> fanrpc_common::Result<()> {
//! let client = Client::builder(TcpDialer, ClientConfig::new(["10.0.0.1:8081"]))
//!     .with_circuit_breaker(ConsecutiveFailureBreaker::default())
//!     .build();
//! let ctx = Context::background();
//! client.start_connection_monitor(&ctx).await?;
//!
//! let peer = client
//!     .round_robin(&ctx.with_method("search"), |_ctx, conn| async move {
//!         Ok(conn.addr)
//!     })
//!     .await?;
//! println!("served by {}", peer);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod config;
mod dispatch;
pub mod handle;
pub mod monitor;
pub mod net;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod singleflight;

pub use backoff::{Attempt, Backoff, ExponentialBackoff};
pub use circuit_breaker::{
    BreakerVerdict, CircuitBreaker, CircuitBreakerConfig, CircuitState, ConsecutiveFailureBreaker,
};
pub use client::{Client, ClientBuilder};
pub use config::{CallOptions, ClientConfig, DialOptions, ReplacePolicy};
pub use handle::{ConnectionHandle, Dialer};
pub use monitor::ErrorStream;
pub use net::{addr_kind, AddrKind};
pub use pool::{PooledConnection, TcpDialer, TcpPool};
pub use registry::Registry;

pub use fanrpc_common::{Code, Context, FanrpcError, Result};
