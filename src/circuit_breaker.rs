//! Per-resource circuit breaker
//!
//! Failure count and last-failure time live in two separate atomics. They
//! are NOT updated together: a reader may observe a new count with the old
//! timestamp for a moment. The resulting state is approximate, which is
//! acceptable for deciding whether to skip a resource.
//!
//! Reopening is governed by one policy only. Once `failures >= max_failures`
//! the breaker is open until `last_failure + backoff(failures)` has passed,
//! where the backoff exponent is capped at `max_backoffs`. After that the
//! breaker is half-open and admits exactly one probe. A successful probe
//! closes it; a failed probe restamps the failure time and it opens again.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Consecutive failures before a resource is skipped
pub const DEFAULT_MAX_FAILURES: u32 = 12;

/// Cap on the backoff exponent (2^12 s is roughly 68 minutes)
pub const DEFAULT_MAX_BACKOFFS: u32 = 12;

/// Unit of the exponential backoff
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since process start, offset by one so that zero
/// can mean "never failed"
fn now_nanos() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64 + 1
}

/// Breaker state as seen by a single observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests proceed
    Closed,
    /// Requests are skipped until the backoff elapses
    Open,
    /// Backoff elapsed; one probe may go through
    HalfOpen,
}

/// Thresholds shared by every breaker in a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub max_failures: u32,
    pub max_backoffs: u32,
    pub base: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        BreakerPolicy {
            max_failures: DEFAULT_MAX_FAILURES,
            max_backoffs: DEFAULT_MAX_BACKOFFS,
            base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl BreakerPolicy {
    pub fn new(max_failures: u32, max_backoffs: u32, base: Duration) -> Self {
        BreakerPolicy {
            max_failures,
            max_backoffs,
            base,
        }
    }

    /// `base * 2^min(failures, max_backoffs)`
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.min(self.max_backoffs).min(31);
        self.base.saturating_mul(1u32 << exponent)
    }
}

/// Permission to call a resource, returned by [`CircuitBreaker::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, normal call
    Closed,
    /// This caller holds the single half-open probe
    Probe { previous: u64, claimed: u64 },
}

/// Lock-free failure bookkeeping for one resource
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    failures: AtomicU32,
    last_failure: AtomicU64,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consecutive failures recorded since the last success or reset
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Time since the last recorded failure, if any
    pub fn since_last_failure(&self) -> Option<Duration> {
        match self.last_failure.load(Ordering::Acquire) {
            0 => None,
            stamp => Some(Duration::from_nanos(now_nanos().saturating_sub(stamp))),
        }
    }

    /// Increment the failure count and stamp the failure time
    ///
    /// The count saturates instead of wrapping.
    pub fn record_failure(&self) {
        let _ = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                Some(f.saturating_add(1))
            });
        self.last_failure.store(now_nanos(), Ordering::Release);
    }

    /// Zero both fields, closing the breaker
    pub fn reset(&self) {
        self.failures.store(0, Ordering::Release);
        self.last_failure.store(0, Ordering::Release);
    }

    /// Record a successful call
    pub fn record_success(&self) {
        if self.failures.load(Ordering::Acquire) != 0 {
            self.reset();
        }
    }

    pub fn state(&self, policy: &BreakerPolicy) -> CircuitState {
        self.state_at(policy, now_nanos())
    }

    fn state_at(&self, policy: &BreakerPolicy, now: u64) -> CircuitState {
        let failures = self.failures.load(Ordering::Acquire);
        if failures < policy.max_failures {
            return CircuitState::Closed;
        }
        let last = self.last_failure.load(Ordering::Acquire);
        let wait = policy.backoff(failures).as_nanos() as u64;
        if now.saturating_sub(last) >= wait {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Ask whether a call may proceed
    ///
    /// # Returns
    /// * `Some(Admission::Closed)` when the breaker is closed
    /// * `Some(Admission::Probe { .. })` for the one caller that wins the half-open probe
    /// * `None` when the breaker is open or another caller already holds the probe
    pub fn admit(&self, policy: &BreakerPolicy) -> Option<Admission> {
        let now = now_nanos();
        match self.state_at(policy, now) {
            CircuitState::Closed => Some(Admission::Closed),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                let previous = self.last_failure.load(Ordering::Acquire);
                // Restamping the failure time reopens the window for everyone else.
                self.last_failure
                    .compare_exchange(previous, now, Ordering::AcqRel, Ordering::Acquire)
                    .ok()
                    .map(|_| Admission::Probe {
                        previous,
                        claimed: now,
                    })
            }
        }
    }

    /// Hand back a probe that ended without a verdict (caller cancelled)
    ///
    /// Restores the failure time so the next caller can probe immediately.
    /// No-op for `Admission::Closed` or if the state moved on meanwhile.
    pub fn release_probe(&self, admission: &Admission) {
        if let Admission::Probe { previous, claimed } = *admission {
            let _ = self.last_failure.compare_exchange(
                claimed,
                previous,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}
