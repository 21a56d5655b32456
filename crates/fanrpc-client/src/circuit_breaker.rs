use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use fanrpc_common::{FanrpcError, Result};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a finished call counts towards its breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerVerdict {
    Success,
    Failure,
    /// Neither, e.g. the caller gave up before the peer answered.
    Ignore,
}

/// Circuit breaker policy, keyed by `"{method}/{addr}"`.
pub trait CircuitBreaker: fmt::Debug + Send + Sync {
    /// Returns [`FanrpcError::CircuitOpen`] when calls for `key` must fail
    /// fast.
    fn allow(&self, key: &str) -> Result<()>;

    /// The admitted call reached the peer; closes the circuit.
    fn record_success(&self, key: &str);

    /// The admitted call failed in a way that counts against the peer.
    fn record_failure(&self, key: &str);

    /// The call admitted by [`allow`](Self::allow) ended without a verdict.
    fn record_ignored(&self, _key: &str) {}
}

impl<'a> dyn CircuitBreaker + 'a {
    /// Runs `f` behind the breaker for `key`. Errors are classified by
    /// `verdict`, successful calls always count as successes.
    ///
    /// A call whose future is dropped before it finishes is recorded as
    /// ignored, so an abandoned half-open probe frees its slot.
    pub async fn run<T, F, Fut, V>(&self, key: &str, f: F, verdict: V) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        V: FnOnce(&FanrpcError) -> BreakerVerdict,
    {
        self.allow(key)?;
        let mut admitted = Admitted {
            breaker: self,
            key,
            settled: false,
        };
        let res = f().await;
        admitted.settled = true;
        match &res {
            Ok(_) => self.record_success(key),
            Err(err) => match verdict(err) {
                BreakerVerdict::Success => self.record_success(key),
                BreakerVerdict::Failure => self.record_failure(key),
                BreakerVerdict::Ignore => self.record_ignored(key),
            },
        }
        res
    }
}

/// A call let through by [`CircuitBreaker::allow`] that has not been
/// recorded yet.
struct Admitted<'a> {
    breaker: &'a dyn CircuitBreaker,
    key: &'a str,
    settled: bool,
}

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(key = self.key, "call dropped before it finished");
            self.breaker.record_ignored(self.key);
        }
    }
}

/// Circuit breaker state for each key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests flow through
    Closed,
    /// Circuit is tripped, requests fail fast without reaching the node
    Open,
    /// A single probe is let through to test if the node has recovered
    HalfOpen,
}

/// Circuit breaker configuration
///
/// # Default Configuration
///
/// - `failure_threshold`: 5
/// - `base_timeout_secs`: 30
/// - `max_timeout_secs`: 300
/// - `backoff_multiplier`: 2.0
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before tripping the circuit
    pub failure_threshold: u32,
    /// Base timeout before attempting half-open (in seconds)
    pub base_timeout_secs: u64,
    /// Maximum timeout cap (in seconds)
    pub max_timeout_secs: u64,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_timeout_secs: 30,
            max_timeout_secs: 300, // 5 minutes
            backoff_multiplier: 2.0,
        }
    }
}

impl CircuitBreakerConfig {
    /// Open timeout after the circuit tripped `trips` times in a row
    pub fn calculate_timeout(&self, trips: u32) -> Duration {
        let base_ms = self.base_timeout_secs * 1000;
        let exp = i32::try_from(trips.saturating_sub(1)).unwrap_or(i32::MAX);
        let backoff_ms = (base_ms as f64 * self.backoff_multiplier.powi(exp)) as u64;
        let max_ms = self.max_timeout_secs * 1000;
        Duration::from_millis(backoff_ms.min(max_ms))
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    /// Times the circuit opened without a success in between
    trips: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trips: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.trips += 1;
        self.opened_at = Some(Instant::now());
        self.probe_in_flight = false;
    }
}

/// Trips after `failure_threshold` consecutive failures, then lets a single
/// probe through once the open timeout has elapsed. The timeout grows with
/// every trip that is not followed by a success.
#[derive(Debug, Default)]
pub struct ConsecutiveFailureBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl ConsecutiveFailureBreaker {
    /// Creates a breaker with every circuit closed.
    ///
    /// # Arguments
    ///
    /// - `config`: Trip threshold and open timeouts shared by all keys
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state of the circuit for `key`. Unknown keys are closed.
    pub fn state(&self, key: &str) -> CircuitState {
        self.circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(CircuitState::Closed, |c| c.state)
    }
}

impl CircuitBreaker for ConsecutiveFailureBreaker {
    fn allow(&self, key: &str) -> Result<()> {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(circuit) = circuits.get_mut(key) else {
            return Ok(());
        };
        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let timeout = self.config.calculate_timeout(circuit.trips);
                let elapsed = circuit.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
                if elapsed >= timeout {
                    debug!(key, "circuit half-open, letting probe through");
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(FanrpcError::CircuitOpen(key.to_string()))
                }
            }
            CircuitState::HalfOpen if circuit.probe_in_flight => {
                Err(FanrpcError::CircuitOpen(key.to_string()))
            }
            CircuitState::HalfOpen => {
                circuit.probe_in_flight = true;
                Ok(())
            }
        }
    }

    fn record_success(&self, key: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(circuit) = circuits.remove(key) {
            if circuit.state != CircuitState::Closed {
                debug!(key, "circuit closed");
            }
        }
    }

    fn record_failure(&self, key: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        let circuit = circuits.entry(key.to_string()).or_insert_with(Circuit::new);
        circuit.consecutive_failures += 1;
        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.open();
                warn!(key, trips = circuit.trips, "probe failed, circuit re-opened");
            }
            CircuitState::Closed if circuit.consecutive_failures >= self.config.failure_threshold => {
                circuit.open();
                warn!(
                    key,
                    failures = circuit.consecutive_failures,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }

    fn record_ignored(&self, key: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(circuit) = circuits.get_mut(key) {
            circuit.probe_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> ConsecutiveFailureBreaker {
        ConsecutiveFailureBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            base_timeout_secs: 1,
            max_timeout_secs: 10,
            backoff_multiplier: 2.0,
        })
    }

    #[test]
    fn test_circuit_breaker_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.base_timeout_secs, 30);
        assert_eq!(config.max_timeout_secs, 300);
        assert_eq!(config.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_circuit_breaker_calculate_timeout() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.calculate_timeout(1).as_secs(), 30);
        assert_eq!(config.calculate_timeout(2).as_secs(), 60);
        assert_eq!(config.calculate_timeout(3).as_secs(), 120);
        assert_eq!(config.calculate_timeout(4).as_secs(), 240);
        // Capped at max
        assert_eq!(config.calculate_timeout(5).as_secs(), 300);
        assert_eq!(config.calculate_timeout(10).as_secs(), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold() {
        let cb = breaker(3);
        for _ in 0..2 {
            cb.record_failure("search/a:1");
        }
        assert_eq!(cb.state("search/a:1"), CircuitState::Closed);
        assert!(cb.allow("search/a:1").is_ok());

        cb.record_failure("search/a:1");
        assert_eq!(cb.state("search/a:1"), CircuitState::Open);
        assert!(cb.allow("search/a:1").unwrap_err().is_circuit_open());

        // other keys are unaffected
        assert!(cb.allow("search/b:1").is_ok());
        assert!(cb.allow("insert/a:1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let cb = breaker(3);
        cb.record_failure("k");
        cb.record_failure("k");
        cb.record_success("k");
        cb.record_failure("k");
        cb.record_failure("k");
        assert_eq!(cb.state("k"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let cb = breaker(1);
        cb.record_failure("k");
        assert!(cb.allow("k").is_err());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(cb.allow("k").is_ok());
        assert_eq!(cb.state("k"), CircuitState::HalfOpen);
        assert!(cb.allow("k").is_err());

        cb.record_success("k");
        assert_eq!(cb.state("k"), CircuitState::Closed);
        assert!(cb.allow("k").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_doubles_timeout() {
        let cb = breaker(1);
        cb.record_failure("k");
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(cb.allow("k").is_ok());
        cb.record_failure("k");
        assert_eq!(cb.state("k"), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(cb.allow("k").is_err());
        tokio::time::advance(Duration::from_millis(501)).await;
        assert!(cb.allow("k").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_probe_is_released() {
        let cb = breaker(1);
        cb.record_failure("k");
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(cb.allow("k").is_ok());
        cb.record_ignored("k");
        assert!(cb.allow("k").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_is_released() {
        let cb = breaker(1);
        cb.record_failure("search/a:1");
        tokio::time::advance(Duration::from_secs(2)).await;

        let dyn_cb: &dyn CircuitBreaker = &cb;
        let probe = dyn_cb.run(
            "search/a:1",
            std::future::pending::<Result<()>>,
            |_| BreakerVerdict::Failure,
        );
        assert!(tokio::time::timeout(Duration::from_millis(10), probe)
            .await
            .is_err());

        assert_eq!(cb.state("search/a:1"), CircuitState::HalfOpen);
        assert!(cb.allow("search/a:1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_probe_is_not_released_twice() {
        let cb = breaker(1);
        cb.record_failure("k");
        tokio::time::advance(Duration::from_secs(2)).await;

        let dyn_cb: &dyn CircuitBreaker = &cb;
        let res = dyn_cb
            .run(
                "k",
                || async { Err::<(), _>(FanrpcError::Connection("reset".into())) },
                |_| BreakerVerdict::Failure,
            )
            .await;
        assert!(res.is_err());

        // the failed probe re-opened the circuit and nothing cleared it
        assert_eq!(cb.state("k"), CircuitState::Open);
        assert!(cb.allow("k").unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_classifies_errors() {
        let cb: Box<dyn CircuitBreaker> = Box::new(breaker(2));

        for _ in 0..2 {
            let res: Result<()> = cb
                .run(
                    "k",
                    || async { Err(FanrpcError::Canceled) },
                    |_| BreakerVerdict::Ignore,
                )
                .await;
            assert!(res.is_err());
        }
        assert!(cb.allow("k").is_ok());

        for _ in 0..2 {
            let _ = cb
                .run(
                    "k",
                    || async { Err::<(), _>(FanrpcError::Connection("reset".into())) },
                    |_| BreakerVerdict::Failure,
                )
                .await;
        }
        let err = cb
            .run("k", || async { Ok(()) }, |_| BreakerVerdict::Success)
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
    }
}
