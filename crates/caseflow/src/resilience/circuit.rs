//! Circuit breaker.
//!
//! Closed/open/half-open state machine per provider (optionally sub-keyed by
//! endpoint class). In `open`, calls fast-fail with `circuit_open` without
//! contacting the provider. After the reset period one transition to
//! half-open admits a bounded number of concurrent probes; the first probe
//! outcome decides whether the circuit closes or re-opens.
//!
//! Only kinds with [`ErrorKind::counts_toward_circuit`] move the state
//! machine: throttling, validation, and not-found outcomes are neutral.
//!
//! Timing uses `tokio::time::Instant` so tests run under paused time.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::CircuitConfig;
use crate::error::{CallError, ErrorKind};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Fast-failing; the provider is not contacted.
    Open,
    /// Probing recovery with a bounded budget.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

/// One provider's (or endpoint class's) breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_after: Duration,
    probe_budget: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Breaker from a circuit shape.
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            reset_after: Duration::from_millis(config.reset_ms),
            probe_budget: config.half_open_probes,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_in_flight: 0,
            }),
        }
    }

    /// Current state (transitions open→half-open lazily on admission).
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive counted failures.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Ask to pass one call through.
    ///
    /// Returns a permit to release when the call sequence finishes. In
    /// half-open, admission consumes one probe slot; callers over the budget
    /// fast-fail. Outcomes are reported via [`on_success`](Self::on_success) /
    /// [`on_error`](Self::on_error) per attempt.
    pub fn admit(&self) -> std::result::Result<CircuitPermit<'_>, CallError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(CircuitPermit { breaker: self, probe: false }),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_after {
                    inner.state = CircuitState::HalfOpen;
                    inner.probes_in_flight = 1;
                    tracing::debug!("circuit half-open, admitting probe");
                    Ok(CircuitPermit { breaker: self, probe: true })
                } else {
                    Err(CallError::new(
                        ErrorKind::CircuitOpen,
                        format!(
                            "circuit open, retry in {}ms",
                            self.reset_after.saturating_sub(elapsed).as_millis()
                        ),
                    ))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.probe_budget {
                    inner.probes_in_flight += 1;
                    Ok(CircuitPermit { breaker: self, probe: true })
                } else {
                    Err(CallError::new(
                        ErrorKind::CircuitOpen,
                        "circuit half-open, probe budget exhausted",
                    ))
                }
            }
        }
    }

    /// Record a successful attempt.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            tracing::debug!("circuit closed after successful probe");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    /// Record a failed attempt. Kinds that do not count toward the circuit
    /// leave the state machine untouched.
    pub fn on_error(&self, kind: ErrorKind) {
        if !kind.counts_toward_circuit() {
            return;
        }
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!(kind = %kind, "probe failed, circuit re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "failure threshold reached, circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {
                // Late failure from a call admitted before opening; keep the timer.
            }
        }
    }

    fn release(&self, probe: bool) {
        if probe {
            let mut inner = self.inner.lock();
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }
}

/// Admission permit; releases the half-open probe slot on drop.
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        self.breaker.release(self.probe);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitConfig {
            failure_threshold: threshold,
            reset_ms,
            half_open_probes: probes,
            scope: crate::config::CircuitScope::PerProvider,
        })
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker(3, 10_000, 1);
        for _ in 0..2 {
            let permit = breaker.admit().unwrap();
            breaker.on_error(ErrorKind::NetworkError);
            drop(permit);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        let permit = breaker.admit().unwrap();
        breaker.on_error(ErrorKind::NetworkError);
        drop(permit);
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.admit().unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = breaker(3, 10_000, 1);
        breaker.on_error(ErrorKind::ServerError);
        breaker.on_error(ErrorKind::ServerError);
        breaker.on_success();
        assert_eq!(breaker.failure_count(), 0);
        breaker.on_error(ErrorKind::ServerError);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn neutral_kinds_do_not_count() {
        let breaker = breaker(2, 10_000, 1);
        breaker.on_error(ErrorKind::Throttled);
        breaker.on_error(ErrorKind::ValidationFailed);
        breaker.on_error(ErrorKind::NotFound);
        breaker.on_error(ErrorKind::BulkheadTimeout);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_success_closes() {
        let breaker = breaker(1, 0, 1);
        breaker.on_error(ErrorKind::NetworkError);
        assert_eq!(breaker.state(), CircuitState::Open);

        // reset_ms = 0, so the next admit transitions to half-open.
        let permit = breaker.admit().unwrap();
        breaker.on_success();
        drop(permit);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = breaker(1, 0, 1);
        breaker.on_error(ErrorKind::NetworkError);
        let permit = breaker.admit().unwrap();
        breaker.on_error(ErrorKind::Timeout);
        drop(permit);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_budget_bounds_concurrent_probes() {
        let breaker = breaker(1, 0, 2);
        breaker.on_error(ErrorKind::NetworkError);

        let p1 = breaker.admit().unwrap();
        let p2 = breaker.admit().unwrap();
        let err = breaker.admit().unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);

        // Releasing a probe frees budget for the next caller.
        drop(p1);
        let p3 = breaker.admit();
        assert!(p3.is_ok());
        drop(p2);
    }
}
