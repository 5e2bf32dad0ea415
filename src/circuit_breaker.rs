//! Failure-counting circuit breaker for flaky upstream calls.
//!
//! `Closed` passes calls through and counts consecutive failures; reaching
//! the threshold opens the circuit. While `Open`, calls are rejected without
//! running. Once the recovery timeout has elapsed a single caller is admitted
//! as the `HalfOpen` trial: success closes the circuit, failure reopens it
//! without touching the failure count.
//!
//! Every admission is stamped with the state epoch it was let in under.
//! Outcomes from an earlier epoch (a slow call admitted while `Closed`
//! that lands after the circuit opened) are dropped, so only the trial
//! itself decides how `HalfOpen` ends.
//!
//! State lives behind one `parking_lot::Mutex` that is never held across an
//! await. Time comes from `tokio::time::Instant` so paused-clock tests work.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::telemetry::CIRCUIT_OPEN_TOTAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Result of a guarded call that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// Rejected without running the operation.
    Open,
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open => f.write_str("circuit open"),
            BreakerError::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Open => None,
            BreakerError::Inner(e) => Some(e),
        }
    }
}

/// Diagnostic snapshot returned by [`CircuitBreaker::status`].
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    epoch: u64,
}

impl Inner {
    fn set_state(&mut self, state: CircuitState) {
        self.state = state;
        self.epoch += 1;
    }
}

#[derive(Debug, Clone, Copy)]
struct Ticket {
    epoch: u64,
    trial: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                opened_at: None,
                trial_in_flight: false,
                epoch: 0,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::new(name, config.failure_threshold, config.recovery_timeout())
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();
        CircuitBreakerStatus {
            state: inner.state,
            consecutive_failures: inner.failures,
            since_last_failure: inner.last_failure.map(|t| t.elapsed()),
        }
    }

    /// Force the circuit closed and forget past failures.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.set_state(CircuitState::Closed);
        inner.failures = 0;
        inner.last_failure = None;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        warn!(breaker = %self.name, "circuit breaker reset");
    }

    /// Run `op` under the breaker.
    ///
    /// Dropping the returned future while it is the half-open trial counts
    /// as a failed trial.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ticket = self.admit::<E>()?;
        let mut guard = TrialGuard { breaker: self, ticket, armed: ticket.trial };
        let result = op().await;
        guard.armed = false;
        match result {
            Ok(v) => {
                self.on_success(ticket);
                Ok(v)
            }
            Err(e) => {
                self.on_failure(ticket);
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn admit<E>(&self) -> Result<Ticket, BreakerError<E>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Ticket { epoch: inner.epoch, trial: false }),
            CircuitState::Open => {
                let ready = inner
                    .opened_at
                    .map_or(true, |t| t.elapsed() >= self.recovery_timeout);
                if !ready {
                    return Err(BreakerError::Open);
                }
                inner.set_state(CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                info!(breaker = %self.name, "circuit half-open, admitting trial call");
                Ok(Ticket { epoch: inner.epoch, trial: true })
            }
            CircuitState::HalfOpen if inner.trial_in_flight => Err(BreakerError::Open),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(Ticket { epoch: inner.epoch, trial: true })
            }
        }
    }

    fn on_success(&self, ticket: Ticket) {
        let mut inner = self.inner.lock();
        if inner.epoch != ticket.epoch {
            debug!(breaker = %self.name, "ignoring success from an earlier circuit state");
            return;
        }
        inner.failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.set_state(CircuitState::Closed);
            inner.opened_at = None;
            inner.trial_in_flight = false;
            info!(breaker = %self.name, "circuit closed");
        }
    }

    fn on_failure(&self, ticket: Ticket) {
        let mut inner = self.inner.lock();
        if inner.epoch != ticket.epoch {
            debug!(breaker = %self.name, "ignoring failure from an earlier circuit state");
            return;
        }
        let now = Instant::now();
        inner.last_failure = Some(now);
        let open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                inner.failures = inner.failures.saturating_add(1);
                inner.failures >= self.failure_threshold
            }
            CircuitState::Open => false,
        };
        if open {
            inner.set_state(CircuitState::Open);
            inner.opened_at = Some(now);
            inner.trial_in_flight = false;
            counter!(CIRCUIT_OPEN_TOTAL, "breaker" => self.name.clone()).increment(1);
            warn!(breaker = %self.name, failures = inner.failures, "circuit opened");
        }
    }
}

struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Ticket,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.on_failure(self.ticket);
        }
    }
}
