use std::time::Duration;

use fanrpc_common::{FanrpcError, Result};
use serde::Deserialize;

/// Per-address dial configuration.
///
/// The client keeps one default set and merges the per-address DNS override
/// on top of it before a handle is built.
///
/// # Default Configuration
///
/// - `pool_size`: 3
/// - `connect_timeout_ms`: 3000
/// - `resolve_dns`: true
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DialOptions {
    /// Number of pooled connections kept per address
    pub pool_size: usize,
    /// Timeout for a single dial in milliseconds
    pub connect_timeout_ms: u64,
    /// Resolve DNS names and dial the resolved IPs
    pub resolve_dns: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            pool_size: 3,
            connect_timeout_ms: 3000,
            resolve_dns: true,
        }
    }
}

impl DialOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Options merged into every dispatched call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CallOptions {
    /// Per-call timeout in milliseconds, `None` leaves the caller's deadline alone
    pub timeout_ms: Option<u64>,
}

impl CallOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// What happens to a handle that was just replaced by a freshly dialed one.
///
/// The new handle is always stored first, so for a short window two handles
/// exist for the same address. This decides how long the old one lives.
/// Draining happens in the background; the connect that replaced the handle
/// returns as soon as the new one is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplacePolicy {
    /// Disconnect the old handle right away, failing calls still using it.
    CloseImmediately,
    /// Wait until no in-flight call holds the old handle, up to `timeout_ms`.
    DrainThenClose { timeout_ms: u64 },
}

impl Default for ReplacePolicy {
    fn default() -> Self {
        ReplacePolicy::DrainThenClose { timeout_ms: 5000 }
    }
}

/// Client configuration.
///
/// # Default Configuration
///
/// - `health_check_interval_ms`: 10000 (10 seconds)
/// - `enable_rebalance`: false
/// - `rebalance_interval_ms`: 1800000 (30 minutes)
/// - `min_connect_timeout_ms`: 3000
/// - `error_stream_capacity`: 100
///
/// # Example
///
/// ```rust
/// use fanrpc_client::ClientConfig;
///
/// let config = ClientConfig::from_json(r#"{
///     "addrs": ["10.0.0.1:8081", "agent-0.agent.svc:8081"],
///     "health_check_interval_ms": 5000,
///     "dial": { "pool_size": 8 }
/// }"#).unwrap();
///
/// assert_eq!(config.addrs.len(), 2);
/// assert_eq!(config.dial.pool_size, 8);
/// assert!(!config.enable_rebalance);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target addresses, fixed for the lifetime of the client
    pub addrs: Vec<String>,
    /// Interval between health-check ticks in milliseconds
    pub health_check_interval_ms: u64,
    /// Run the rebalance ticker
    pub enable_rebalance: bool,
    /// Interval between rebalance ticks in milliseconds
    pub rebalance_interval_ms: u64,
    /// Timeout applied to each connect attempt made by the monitor
    pub min_connect_timeout_ms: u64,
    /// Capacity of the monitor's error stream
    pub error_stream_capacity: usize,
    pub replace_policy: ReplacePolicy,
    pub dial: DialOptions,
    pub call: CallOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            health_check_interval_ms: 10_000,
            enable_rebalance: false,
            rebalance_interval_ms: 30 * 60 * 1000,
            min_connect_timeout_ms: 3000,
            error_stream_capacity: 100,
            replace_policy: ReplacePolicy::default(),
            dial: DialOptions::default(),
            call: CallOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Default configuration for `addrs`.
    ///
    /// # Arguments
    ///
    /// - `addrs`: Target addresses, either `ip:port` or `host:port`
    pub fn new(addrs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            addrs: addrs.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Parses a configuration from JSON. Missing fields keep their defaults.
    ///
    /// # Returns
    ///
    /// [`FanrpcError::Config`] with the parser message on malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| FanrpcError::Config(e.to_string()))
    }

    /// Interval between health ticks, at least one millisecond.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    /// The rebalance interval when rebalancing is on, otherwise the
    /// health-check interval is reused.
    pub fn rebalance_interval(&self) -> Duration {
        if self.enable_rebalance {
            Duration::from_millis(self.rebalance_interval_ms.max(1))
        } else {
            self.health_check_interval()
        }
    }

    /// Budget for draining the pending-reconnect set after a tick.
    ///
    /// # Returns
    ///
    /// The shorter of the two tick intervals. With rebalancing off that is
    /// the health-check interval, since [`rebalance_interval`](Self::rebalance_interval)
    /// falls back to it.
    pub fn reconnect_budget(&self) -> Duration {
        self.health_check_interval().min(self.rebalance_interval())
    }

    pub fn min_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.min_connect_timeout_ms)
    }
}
