// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::watch;

#[async_trait]
/// Time source and sleeper for the polling loops.
/// Tests swap in [`ManualClock`] so hour-long waits finish instantly.
pub trait ClockPort: Send + Sync {
    fn now_utc(&self) -> OffsetDateTime;

    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClockPort for SystemClock {
    fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: `sleep` advances the current time and returns immediately.
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
    slept: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
            slept: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += duration;
        }
    }

    /// Total time spent in `sleep`.
    pub fn slept(&self) -> Duration {
        self.slept.lock().map(|slept| *slept).unwrap_or_default()
    }
}

#[async_trait]
impl ClockPort for ManualClock {
    fn now_utc(&self) -> OffsetDateTime {
        self.now
            .lock()
            .map(|now| *now)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        if let Ok(mut slept) = self.slept.lock() {
            *slept += duration;
        }
        tokio::task::yield_now().await;
    }
}

/// Sleeps for `duration` unless `cancel` flips to true first.
/// Returns `false` when cancelled.
pub async fn sleep_or_cancel(
    clock: &dyn ClockPort,
    duration: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> bool {
    if *cancel.borrow() {
        return false;
    }
    tokio::select! {
        _ = clock.sleep(duration) => !*cancel.borrow(),
        changed = cancel.changed() => match changed {
            Ok(()) => !*cancel.borrow(),
            // Sender gone: nobody can cancel any more, finish the wait.
            Err(_) => {
                clock.sleep(duration).await;
                true
            }
        },
    }
}

/// Converts a std duration for comparisons against `OffsetDateTime` differences.
pub fn to_time_duration(duration: Duration) -> time::Duration {
    time::Duration::try_from(duration).unwrap_or(time::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_sleep_advances_time() {
        let start = OffsetDateTime::UNIX_EPOCH;
        let clock = ManualClock::new(start);
        clock.sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now_utc() - start, time::Duration::seconds(90));
        assert_eq!(clock.slept(), Duration::from_secs(90));
        clock.advance(Duration::from_secs(10));
        assert_eq!(clock.slept(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn sleep_or_cancel_returns_false_when_already_cancelled() {
        let clock = ManualClock::new(OffsetDateTime::UNIX_EPOCH);
        let (_tx, mut rx) = watch::channel(true);
        assert!(!sleep_or_cancel(&clock, Duration::from_secs(5), &mut rx).await);
        assert_eq!(clock.slept(), Duration::ZERO);
    }

    #[tokio::test]
    async fn sleep_or_cancel_completes_without_cancellation() {
        let clock = ManualClock::new(OffsetDateTime::UNIX_EPOCH);
        let (_tx, mut rx) = watch::channel(false);
        assert!(sleep_or_cancel(&clock, Duration::from_secs(5), &mut rx).await);
        assert_eq!(clock.slept(), Duration::from_secs(5));
    }

    #[test]
    fn to_time_duration_saturates() {
        assert_eq!(to_time_duration(Duration::from_secs(3)), time::Duration::seconds(3));
        assert_eq!(to_time_duration(Duration::MAX), time::Duration::MAX);
    }
}
