//! Resilience primitives
//!
//! Timeout wrapper, exponential-backoff retry, and a three-state circuit
//! breaker. The breaker registry is the only process-wide state in the
//! crate; it is bounded and resettable for tests.

use localbus_core::{BusError, BusResult, OperationKind, OperationalError};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// TIMEOUT
// ============================================================================

/// Run `op` on a worker thread, aborting the wait after `timeout`.
///
/// On expiry the caller gets `OperationTimeout` and the worker is left to
/// finish in the background; entity state stays consistent because every
/// state-mutating step runs under the entity mutex.
pub fn with_timeout<T, F>(kind: OperationKind, timeout: Duration, op: F) -> BusResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> BusResult<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver may be gone if the wait timed out.
        let _ = tx.send(op());
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(BusError::Operation(OperationalError::Timeout {
            operation: kind.as_str().to_string(),
            seconds: timeout.as_secs_f64(),
        })),
    }
}

/// Run `op` with the operation kind's default deadline.
pub fn with_default_timeout<T, F>(kind: OperationKind, op: F) -> BusResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> BusResult<T> + Send + 'static,
{
    with_timeout(kind, kind.default_timeout(), op)
}

// ============================================================================
// RETRY
// ============================================================================

/// Exponential-backoff retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// The default retryability predicate: transient errors only.
pub fn is_retryable(error: &BusError) -> bool {
    error.is_transient()
}

/// Retry `op` while `predicate` approves the error, sleeping an
/// exponentially growing backoff (capped) between attempts.
pub fn with_retry<T, F, P>(policy: &RetryPolicy, predicate: P, mut op: F) -> BusResult<T>
where
    F: FnMut() -> BusResult<T>,
    P: Fn(&BusError) -> bool,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= policy.max_attempts || !predicate(&error) {
                    return Err(error);
                }
                thread::sleep(backoff);
                backoff = Duration::from_secs_f64(
                    (backoff.as_secs_f64() * policy.multiplier)
                        .min(policy.max_backoff.as_secs_f64()),
                );
            }
        }
    }
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow; consecutive failures are counted.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// A bounded number of probe calls are admitted.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
}

/// Three-state circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        half_open_max_calls: u32,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            half_open_max_calls: half_open_max_calls.max(1),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker mutex");
        self.maybe_half_open(&mut inner);
        inner.state
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let cooled = inner
                .last_failure
                .map(|at| at.elapsed() >= self.reset_timeout)
                .unwrap_or(true);
            if cooled {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_in_flight = 0;
            }
        }
    }

    fn rejection(&self, failures: u32) -> BusError {
        BusError::Operation(OperationalError::CircuitOpen {
            name: self.name.clone(),
            failure_count: failures,
        })
    }

    /// Run `op` through the breaker.
    pub fn call<T>(&self, op: impl FnOnce() -> BusResult<T>) -> BusResult<T> {
        {
            let mut inner = self.inner.lock().expect("breaker mutex");
            self.maybe_half_open(&mut inner);
            match inner.state {
                CircuitState::Open => {
                    return Err(self.rejection(inner.consecutive_failures));
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight >= self.half_open_max_calls {
                        return Err(self.rejection(inner.consecutive_failures));
                    }
                    inner.half_open_in_flight += 1;
                }
                CircuitState::Closed => {}
            }
        }

        // The mutex is not held across the guarded call.
        let result = op();

        let mut inner = self.inner.lock().expect("breaker mutex");
        match &result {
            Ok(_) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.half_open_in_flight = 0;
            }
            Err(_) => {
                inner.consecutive_failures += 1;
                inner.last_failure = Some(Instant::now());
                if inner.state == CircuitState::HalfOpen
                    || inner.consecutive_failures >= self.failure_threshold
                {
                    inner.state = CircuitState::Open;
                    inner.half_open_in_flight = 0;
                }
            }
        }
        result
    }
}

// ============================================================================
// BREAKER REGISTRY
// ============================================================================

/// Growth bound for the registry; beyond it breakers are created untracked.
const MAX_REGISTERED_BREAKERS: usize = 256;

static BREAKERS: Lazy<Mutex<HashMap<String, Arc<CircuitBreaker>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Get or create the named breaker.
pub fn breaker(
    name: &str,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
) -> Arc<CircuitBreaker> {
    let mut registry = BREAKERS.lock().expect("breaker registry mutex");
    if let Some(existing) = registry.get(name) {
        return Arc::clone(existing);
    }
    let created = Arc::new(CircuitBreaker::new(
        name,
        failure_threshold,
        reset_timeout,
        half_open_max_calls,
    ));
    if registry.len() < MAX_REGISTERED_BREAKERS {
        registry.insert(name.to_string(), Arc::clone(&created));
    }
    created
}

/// Forget every registered breaker (tests).
pub fn reset_breakers() {
    BREAKERS.lock().expect("breaker registry mutex").clear();
}
