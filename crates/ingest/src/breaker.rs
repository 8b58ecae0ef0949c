//! Circuit breaker guarding the database
//!
//! A small state machine that gates the writer's database calls. After
//! `failure_threshold` consecutive failed submissions the circuit opens
//! and every call is rejected without touching the database. Once
//! `reset_timeout` has elapsed a single probe is admitted; its outcome
//! decides between closing the circuit and restarting the open timer.
//!
//! The breaker gates, it does not rate-limit. State is mutated only by
//! the writer through [`CircuitBreaker::allow`],
//! [`CircuitBreaker::record_success`] and
//! [`CircuitBreaker::record_failure`]; other components observe value
//! snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use timescale_ingest_config::BreakerConfig;
use tracing::{debug, info, warn};

/// Outcome of the admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Reject,
}

/// Snapshot of the breaker state for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub fn name(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::HalfOpen => "half_open",
            BreakerState::Open => "open",
        }
    }

    /// Gauge encoding: 0 = closed, 1 = half-open, 2 = open.
    pub fn gauge_value(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

enum State {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { probe_started: Option<Instant> },
}

struct Inner {
    state: State,
    consecutive_failures: u32,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            reset_timeout_secs = config.reset_timeout.as_secs_f64(),
            "circuit breaker initialized"
        );
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
            }),
            trips: AtomicU64::new(0),
        }
    }

    /// Admission check for one logical submission.
    ///
    /// In `OPEN`, rejects until `reset_timeout` has elapsed, then moves
    /// to `HALF_OPEN` and admits the caller as the probe. In
    /// `HALF_OPEN`, at most one probe is in flight; a probe outstanding
    /// longer than `half_open_timeout` is treated as lost and its slot
    /// is handed to the next caller.
    pub fn allow(&self) -> Decision {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => Decision::Proceed,
            State::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    info!(
                        open_for_secs = opened_at.elapsed().as_secs_f64(),
                        "circuit breaker half-open, admitting probe"
                    );
                    inner.state = State::HalfOpen {
                        probe_started: Some(Instant::now()),
                    };
                    Decision::Proceed
                } else {
                    Decision::Reject
                }
            }
            State::HalfOpen { probe_started } => match probe_started {
                None => {
                    inner.state = State::HalfOpen {
                        probe_started: Some(Instant::now()),
                    };
                    Decision::Proceed
                }
                Some(started) if started.elapsed() >= self.config.half_open_timeout => {
                    warn!("half-open probe timed out without reporting, admitting a new probe");
                    inner.state = State::HalfOpen {
                        probe_started: Some(Instant::now()),
                    };
                    Decision::Proceed
                }
                Some(_) => Decision::Reject,
            },
        }
    }

    /// Record a successful submission.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if let State::HalfOpen { .. } = inner.state {
            info!("circuit breaker closed after successful probe");
            inner.state = State::Closed;
        }
    }

    /// Record a failed submission. Returns `true` if this failure
    /// tripped the circuit open.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        match inner.state {
            State::Closed => {
                debug!(
                    failures = inner.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "submission failed in closed state"
                );
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker tripped"
                    );
                    inner.state = State::Open {
                        opened_at: Instant::now(),
                    };
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { .. } => {
                warn!("probe failed, circuit breaker reopened");
                inner.state = State::Open {
                    opened_at: Instant::now(),
                };
                self.trips.fetch_add(1, Ordering::Relaxed);
                true
            }
            State::Open { .. } => false,
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> BreakerState {
        match self.inner.lock().state {
            State::Closed => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Consecutive failures in the current run.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// How many times the circuit has opened.
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(threshold: u32, reset_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
            half_open_timeout: Duration::from_millis(reset_ms * 4),
        }
    }

    #[test]
    fn test_starts_closed_and_allows() {
        let cb = CircuitBreaker::new(config(3, 100));
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.allow(), Decision::Proceed);
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(config(3, 100));

        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert!(cb.record_failure());

        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.allow(), Decision::Reject);
        assert_eq!(cb.trips(), 1);
    }

    #[test]
    fn test_success_clears_failure_count() {
        let cb = CircuitBreaker::new(config(3, 100));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.consecutive_failures(), 2);

        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.state(), BreakerState::Closed);

        // Two more failures are not enough to trip after the reset.
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_admits_single_probe_after_reset_timeout() {
        let cb = CircuitBreaker::new(config(1, 50));
        cb.record_failure();
        assert_eq!(cb.allow(), Decision::Reject);

        std::thread::sleep(Duration::from_millis(80));

        // First caller becomes the probe, the second is rejected.
        assert_eq!(cb.allow(), Decision::Proceed);
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert_eq!(cb.allow(), Decision::Reject);
    }

    #[test]
    fn test_probe_success_closes() {
        let cb = CircuitBreaker::new(config(1, 50));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cb.allow(), Decision::Proceed);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.allow(), Decision::Proceed);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let cb = CircuitBreaker::new(config(1, 50));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cb.allow(), Decision::Proceed);

        assert!(cb.record_failure());
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.allow(), Decision::Reject);
        assert_eq!(cb.trips(), 2);
    }

    #[test]
    fn test_stale_probe_slot_is_reclaimed() {
        let cb = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(30),
            half_open_timeout: Duration::from_millis(60),
        });
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(50));

        // Probe admitted but never reports.
        assert_eq!(cb.allow(), Decision::Proceed);
        assert_eq!(cb.allow(), Decision::Reject);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cb.allow(), Decision::Proceed);
    }

    #[test]
    fn test_gauge_values() {
        assert_eq!(BreakerState::Closed.gauge_value(), 0);
        assert_eq!(BreakerState::HalfOpen.gauge_value(), 1);
        assert_eq!(BreakerState::Open.gauge_value(), 2);
        assert_eq!(BreakerState::Open.name(), "open");
    }
}
