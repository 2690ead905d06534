// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time tracking for test runs.
//!
//! Durations are measured with a monotonic [`Instant`] while start times are
//! taken from the realtime clock, so reports carry wall-clock timestamps but
//! elapsed values never go backwards.

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};
use tokio::{
    sync::watch,
    time::{Instant as TokioInstant, sleep_until},
};

pub(crate) fn stopwatch() -> Stopwatch {
    Stopwatch::new()
}

/// A started stopwatch.
#[derive(Clone, Debug)]
pub(crate) struct Stopwatch {
    start_time: DateTime<Local>,
    instant: Instant,
}

impl Stopwatch {
    fn new() -> Self {
        Self {
            // These two reads happen imperceptibly close to each other, which
            // is good enough for our purposes.
            start_time: Local::now(),
            instant: Instant::now(),
        }
    }

    pub(crate) fn snapshot(&self) -> StopwatchSnapshot {
        StopwatchSnapshot {
            start_time: self.start_time,
            elapsed: self.instant.elapsed(),
        }
    }
}

/// A snapshot of a stopwatch.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StopwatchSnapshot {
    /// The time at which the stopwatch was started.
    pub(crate) start_time: DateTime<Local>,

    /// The time elapsed since the start.
    pub(crate) elapsed: Duration,
}

/// Sleeps for `duration`, or forever when no bound is configured. Used for
/// the optional global timeout.
pub(crate) async fn pending_or_sleep(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Creates an adjustable deadline. The returned handle can push the deadline
/// forward or backward while the timer side is being awaited; `TestInfo::
/// set_timeout` is wired to it.
pub(crate) fn deadline(timeout: Duration) -> (DeadlineHandle, DeadlineTimer) {
    let started = TokioInstant::now();
    let (tx, rx) = watch::channel(timeout);
    (
        DeadlineHandle {
            started,
            tx,
        },
        DeadlineTimer {
            started,
            rx,
        },
    )
}

/// The controlling side of an adjustable deadline.
#[derive(Clone, Debug)]
pub(crate) struct DeadlineHandle {
    started: TokioInstant,
    tx: watch::Sender<Duration>,
}

impl DeadlineHandle {
    /// Replaces the timeout, measured from when the deadline was created.
    pub(crate) fn set_timeout(&self, timeout: Duration) {
        // Failure means the timer was dropped; the deadline no longer
        // matters.
        let _ = self.tx.send(timeout);
    }

    /// The instant at which the deadline expires.
    pub(crate) fn expires_at(&self) -> TokioInstant {
        self.started + *self.tx.borrow()
    }

    /// Time remaining until expiry, zero if already past.
    pub(crate) fn remaining(&self) -> Duration {
        self.expires_at().saturating_duration_since(TokioInstant::now())
    }

    /// The currently configured timeout.
    pub(crate) fn timeout(&self) -> Duration {
        *self.tx.borrow()
    }
}

/// The awaitable side of an adjustable deadline.
#[derive(Debug)]
pub(crate) struct DeadlineTimer {
    started: TokioInstant,
    rx: watch::Receiver<Duration>,
}

impl DeadlineTimer {
    /// Resolves when the deadline expires. Timeout adjustments made through
    /// the handle are picked up while waiting.
    pub(crate) async fn expired(&mut self) {
        loop {
            let expires_at = self.started + *self.rx.borrow_and_update();
            tokio::select! {
                _ = sleep_until(expires_at) => return,
                res = self.rx.changed() => {
                    if res.is_err() {
                        // The handle is gone; the last observed deadline
                        // stands.
                        sleep_until(expires_at).await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let (_handle, mut timer) = deadline(Duration::from_secs(5));
        let before = TokioInstant::now();
        timer.expired().await;
        assert!(TokioInstant::now() - before >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_extension_is_observed() {
        let (handle, mut timer) = deadline(Duration::from_secs(1));
        handle.set_timeout(Duration::from_secs(10));
        let before = TokioInstant::now();
        timer.expired().await;
        assert!(TokioInstant::now() - before >= Duration::from_secs(10));
    }

    #[test]
    fn stopwatch_elapsed_grows() {
        let sw = stopwatch();
        let first = sw.snapshot().elapsed;
        std::thread::sleep(Duration::from_millis(10));
        let second = sw.snapshot().elapsed;
        assert!(second >= first);
    }
}
