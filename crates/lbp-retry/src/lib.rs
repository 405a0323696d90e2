// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry policies, timeout configuration, and circuit breaker state machine
//! used by the periodic runner.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use lbp_cancel::CancellationToken;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Timeout / retry policy
// ---------------------------------------------------------------------------

/// Per-attempt deadline applied to a single try within a retry envelope.
///
/// Deadlines are per-attempt, not per-envelope: each attempt gets its own
/// bounded window rather than the whole retry loop sharing one deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum time a single attempt may take.
    pub per_attempt: Duration,
}

impl TimeoutConfig {
    /// Construct a new per-attempt timeout.
    #[must_use]
    pub fn new(per_attempt: Duration) -> Self {
        Self { per_attempt }
    }
}

/// Exponential backoff retry policy: `base_delay * 2^attempt`, capped at
/// `max_attempts` tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    /// Start building a policy with the given base delay.
    #[must_use]
    pub fn builder(base_delay: Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            base_delay,
            max_attempts: 3,
        }
    }

    /// Delay to wait before the given zero-indexed attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }

    /// Maximum number of attempts this policy allows.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicyBuilder {
    base_delay: Duration,
    max_attempts: u32,
}

impl RetryPolicyBuilder {
    /// Set the maximum number of attempts (minimum 1).
    #[must_use]
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    /// Finish building the policy.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.base_delay,
            max_attempts: self.max_attempts,
        }
    }
}

/// Run `f` up to `policy.max_attempts()` times with exponential backoff
/// between attempts, checking `cancel` before each attempt and between
/// retries.
///
/// Returns the first `Ok`, or the last `Err` if every attempt fails. Returns
/// early with the last observed error (or `None` if cancelled before any
/// attempt ran) if `cancel` fires mid-loop.
pub async fn execute_with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut last_err: Option<E> = None;
    for attempt in 0..policy.max_attempts() {
        if cancel.is_cancelled() {
            break;
        }
        if attempt > 0 {
            let delay = policy.delay_for_attempt(attempt - 1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                tracing::debug!(attempt, "execute_with_retry: attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("at least one attempt runs unless cancelled before the first try"))
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// The three states of a runner's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Healthy: tasks run normally.
    Closed,
    /// Tripped: tasks are skipped until `reset_after` elapses.
    Open,
    /// Probing: one trial invocation is allowed to decide CLOSED vs OPEN.
    HalfOpen,
}

/// Consecutive-failure circuit breaker. State is private to one periodic
/// runner instance; one runner drives one loop.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_after: Duration,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Construct a new, closed breaker.
    ///
    /// `threshold` is the number of consecutive failures that trips the
    /// breaker open; `reset_after` is how long it stays open before
    /// allowing a half-open probe.
    #[must_use]
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_after,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Current state of the breaker. If OPEN and `reset_after` has elapsed,
    /// this transitions to HALF_OPEN as a side effect, matching the single
    /// HALF_OPEN-trial semantics of `allow()`.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.maybe_half_open(&mut self.inner.lock().expect("breaker lock poisoned"))
    }

    /// Whether the caller may invoke the guarded task this tick.
    ///
    /// CLOSED and HALF_OPEN both allow a call (HALF_OPEN allows exactly the
    /// one probing trial, since a runner drives its loop single-flight).
    /// OPEN refuses until `reset_after` has elapsed.
    #[must_use]
    pub fn allow(&self) -> bool {
        !matches!(self.state(), BreakerState::Open)
    }

    /// Record a successful invocation.
    ///
    /// CLOSED stays CLOSED with the failure counter reset. HALF_OPEN closes
    /// the breaker.
    pub fn record_success(&self) {
        let mut guard = self.inner.lock().expect("breaker lock poisoned");
        guard.state = BreakerState::Closed;
        guard.consecutive_failures = 0;
        guard.opened_at = None;
    }

    /// Record a failed invocation.
    ///
    /// CLOSED trips to OPEN after `threshold` consecutive failures.
    /// HALF_OPEN immediately reopens on a single failure.
    pub fn record_failure(&self) {
        let mut guard = self.inner.lock().expect("breaker lock poisoned");
        match guard.state {
            BreakerState::Closed => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.threshold {
                    tracing::warn!(
                        threshold = self.threshold,
                        "circuit breaker tripped open"
                    );
                    guard.state = BreakerState::Open;
                    guard.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                guard.state = BreakerState::Open;
                guard.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }

    fn maybe_half_open(&self, guard: &mut Inner) -> BreakerState {
        if guard.state == BreakerState::Open {
            if let Some(opened_at) = guard.opened_at {
                if opened_at.elapsed() >= self.reset_after {
                    guard.state = BreakerState::HalfOpen;
                }
            }
        }
        guard.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbp_cancel::CancellationToken;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retry_policy_doubles_delay_per_attempt() {
        let policy = RetryPolicy::builder(Duration::from_millis(10))
            .max_attempts(4)
            .build();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(40));
    }

    #[test]
    fn builder_clamps_max_attempts_to_at_least_one() {
        let policy = RetryPolicy::builder(Duration::from_millis(1))
            .max_attempts(0)
            .build();
        assert_eq!(policy.max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_with_retry_succeeds_on_later_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::builder(Duration::from_millis(1))
            .max_attempts(3)
            .build();
        let cancel = CancellationToken::new();
        let result: Result<u32, &'static str> = execute_with_retry(policy, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_with_retry_returns_last_error_after_exhaustion() {
        let policy = RetryPolicy::builder(Duration::from_millis(1))
            .max_attempts(3)
            .build();
        let cancel = CancellationToken::new();
        let result: Result<u32, &'static str> =
            execute_with_retry(policy, &cancel, || async { Err("boom") }).await;
        assert_eq!(result, Err("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_with_retry_stops_when_cancelled() {
        let policy = RetryPolicy::builder(Duration::from_secs(10))
            .max_attempts(5)
            .build();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        cancel.cancel();
        let result: Result<u32, &'static str> = execute_with_retry(policy, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "no attempt after pre-cancellation");
    }

    #[test]
    fn breaker_starts_closed_and_allows() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn breaker_trips_open_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn breaker_success_resets_failure_counter() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn breaker_transitions_to_half_open_after_reset_elapses() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow());
    }

    #[test]
    fn breaker_half_open_success_closes() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn breaker_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
