// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-flight periodic task runner with circuit breaker.
//!
//! Drives a task in a loop: between iterations, waits until whichever comes
//! first — the configured interval elapses, an external trigger fires, or
//! the run is cancelled. Exactly one task invocation is ever in flight,
//! since the loop awaits completion before considering the next tick.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use lbp_cancel::CancellationToken;
use lbp_error::{ErrorCode, LbpError};
use lbp_retry::{BreakerState, CircuitBreaker};
use std::future::Future;
use std::time::Duration;

/// A handle callers use to wake a [`PeriodicRunner`] before its interval
/// elapses, e.g. a job was just enqueued and the sweeper shouldn't wait.
#[derive(Clone)]
pub struct Trigger {
    tx: tokio::sync::mpsc::Sender<()>,
}

impl Trigger {
    /// Wake the runner on its next select. Best-effort: if the channel is
    /// already full (a wake is already pending) this is a silent no-op.
    pub fn fire(&self) {
        let _ = self.tx.try_send(());
    }
}

/// A periodic, single-flight, circuit-breaker-guarded task loop.
pub struct PeriodicRunner {
    interval: Duration,
    breaker: CircuitBreaker,
    trigger_rx: tokio::sync::mpsc::Receiver<()>,
}

impl PeriodicRunner {
    /// Construct a runner and its paired [`Trigger`].
    ///
    /// `threshold` consecutive task failures trip the breaker open;
    /// `reset_after` is how long it stays open before a half-open probe.
    #[must_use]
    pub fn new(interval: Duration, threshold: u32, reset_after: Duration) -> (Self, Trigger) {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        (
            Self {
                interval,
                breaker: CircuitBreaker::new(threshold, reset_after),
                trigger_rx: rx,
            },
            Trigger { tx },
        )
    }

    /// Current breaker state, for diagnostics/health checks.
    #[must_use]
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Run `task` until `cancel` fires.
    ///
    /// `task` receives a clone of the cancellation token so it can propagate
    /// cancellation into its own I/O. `on_error` is invoked for every failed
    /// tick, including breaker-open skips, and is never expected to fail
    /// itself — it is a sink, not a fallible step.
    pub async fn run<F, Fut>(mut self, cancel: CancellationToken, mut task: F, mut on_error: impl FnMut(&LbpError))
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), LbpError>>,
    {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.trigger_rx.recv() => {}
                () = cancel.cancelled() => break,
            }
            if cancel.is_cancelled() {
                break;
            }

            if !self.breaker.allow() {
                on_error(&LbpError::new(
                    ErrorCode::BreakerOpen,
                    "breaker open, skipping this tick",
                ));
                continue;
            }

            match task(cancel.clone()).await {
                Ok(()) => self.breaker.record_success(),
                Err(err) => {
                    if err.is_breaker_relevant() {
                        self.breaker.record_failure();
                    }
                    on_error(&err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn runs_task_on_each_tick_until_cancelled() {
        let (runner, _trigger) = PeriodicRunner::new(Duration::from_millis(10), 5, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let ticks = Arc::new(AtomicU32::new(0));

        let cancel_for_task = cancel.clone();
        let ticks_for_task = ticks.clone();
        let handle = tokio::spawn(runner.run(
            cancel.clone(),
            move |_c| {
                let ticks = ticks_for_task.clone();
                let cancel = cancel_for_task.clone();
                async move {
                    let n = ticks.fetch_add(1, Ordering::SeqCst) + 1;
                    if n == 3 {
                        cancel.cancel();
                    }
                    Ok(())
                }
            },
            |_err| {},
        ));

        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("runner loop should exit after cancellation")
            .unwrap();

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_wakes_loop_before_interval_elapses() {
        let (runner, trigger) = PeriodicRunner::new(Duration::from_secs(3600), 5, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let ticks = Arc::new(AtomicU32::new(0));

        let cancel_for_task = cancel.clone();
        let ticks_for_task = ticks.clone();
        let handle = tokio::spawn(runner.run(
            cancel.clone(),
            move |_c| {
                let ticks = ticks_for_task.clone();
                let cancel = cancel_for_task.clone();
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    cancel.cancel();
                    Ok(())
                }
            },
            |_err| {},
        ));

        tokio::task::yield_now().await;
        trigger.fire();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("trigger should wake the loop well before the hour-long interval")
            .unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_skips_ticks_once_open_and_reports_breaker_open() {
        let (runner, _trigger) =
            PeriodicRunner::new(Duration::from_millis(10), 2, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));

        let attempts_for_task = attempts.clone();
        let errors_for_sink = errors.clone();
        let handle = tokio::spawn(runner.run(
            cancel.clone(),
            move |_c| {
                let attempts = attempts_for_task.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(LbpError::new(ErrorCode::UpstreamUnavailable, "down"))
                }
            },
            move |err| errors_for_sink.lock().unwrap().push(err.code),
        ));

        for _ in 0..4 {
            tokio::time::advance(Duration::from_millis(10)).await;
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit")
            .unwrap();

        // threshold=2: first two ticks trip the breaker, subsequent ticks are
        // skipped with BreakerOpen and never reach the task.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let codes = errors.lock().unwrap().clone();
        assert!(codes.iter().any(|c| *c == ErrorCode::BreakerOpen));
    }
}
