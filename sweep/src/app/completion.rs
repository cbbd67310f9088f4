// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;
use sweepcore::clock::{ClockPort, sleep_or_cancel, to_time_duration};
use sweepcore::errors::{AppError, AppErrorKind, AppResult, codes};
use tokio::sync::watch;

use crate::app::ports::RemotePort;
use crate::app::types::CompletionSettings;

#[async_trait]
/// Waits until the driver reports that a run is over.
pub trait CompletionWaiter: Send + Sync {
    async fn wait(&self, flag: &str, cancel: &mut watch::Receiver<bool>) -> AppResult<()>;
}

/// Polls for the completion flag file next to the run directory.
pub struct FlagFileWaiter {
    remote: Arc<dyn RemotePort>,
    clock: Arc<dyn ClockPort>,
    settings: CompletionSettings,
}

impl FlagFileWaiter {
    pub fn new(
        remote: Arc<dyn RemotePort>,
        clock: Arc<dyn ClockPort>,
        settings: CompletionSettings,
    ) -> Self {
        Self {
            remote,
            clock,
            settings,
        }
    }
}

#[async_trait]
impl CompletionWaiter for FlagFileWaiter {
    async fn wait(&self, flag: &str, cancel: &mut watch::Receiver<bool>) -> AppResult<()> {
        let started = self.clock.now_utc();
        let timeout = to_time_duration(self.settings.timeout);
        let mut polls: u64 = 0;
        loop {
            polls += 1;
            if self.remote.exists(flag).await? {
                tracing::info!(flag, polls, "completion flag found");
                return Ok(());
            }
            let waited = self.clock.now_utc() - started;
            if waited >= timeout {
                tracing::error!(
                    flag,
                    timeout_secs = self.settings.timeout.as_secs(),
                    "gave up waiting for the driver; remote state is left in place"
                );
                return Err(AppError::with_message(
                    AppErrorKind::DeadlineExceeded,
                    codes::TIMEOUT,
                    format!(
                        "completion flag {flag} did not appear within {}s",
                        self.settings.timeout.as_secs()
                    ),
                ));
            }
            tracing::debug!(flag, polls, waited_secs = waited.whole_seconds(), "driver still running");
            if !sleep_or_cancel(self.clock.as_ref(), self.settings.poll_interval, cancel).await {
                return Err(AppError::with_message(
                    AppErrorKind::Cancelled,
                    codes::CANCELED,
                    "interrupted while waiting for the driver",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use sweepcore::clock::ManualClock;
    use sweepcore::exec::ExecCapture;
    use time::macros::datetime;

    /// Reports the flag as present from the `appears_after`-th check on.
    struct FlagAfter {
        appears_after: Option<u32>,
        checks: Mutex<u32>,
    }

    #[async_trait]
    impl RemotePort for FlagAfter {
        async fn connect(&self) -> AppResult<()> {
            Ok(())
        }

        async fn run(&self, _command: &str) -> AppResult<ExecCapture> {
            unreachable!("waiter only checks for the flag")
        }

        async fn ensure_landed(&self, _path: &str) -> AppResult<()> {
            unreachable!("waiter only checks for the flag")
        }

        async fn exists(&self, path: &str) -> AppResult<bool> {
            assert_eq!(path, "/home/alice/sweep/b/b_run_1_completion_flag");
            let mut checks = self.checks.lock().expect("checks lock");
            *checks += 1;
            Ok(self.appears_after.is_some_and(|after| *checks >= after))
        }

        async fn put(&self, _local: &Path, _remote: &str) -> AppResult<()> {
            unreachable!("waiter only checks for the flag")
        }

        async fn get(&self, _remote: &str, _local: &Path) -> AppResult<()> {
            unreachable!("waiter only checks for the flag")
        }

        async fn remove_file(&self, _remote: &str) -> AppResult<()> {
            unreachable!("waiter only checks for the flag")
        }

        async fn disconnect(&self) {}
    }

    fn waiter(appears_after: Option<u32>, timeout_secs: u64) -> (FlagFileWaiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2026-03-01 12:00 UTC)));
        let remote = Arc::new(FlagAfter {
            appears_after,
            checks: Mutex::new(0),
        });
        let waiter = FlagFileWaiter::new(
            remote,
            clock.clone(),
            CompletionSettings {
                poll_interval: Duration::from_secs(5),
                timeout: Duration::from_secs(timeout_secs),
            },
        );
        (waiter, clock)
    }

    const FLAG: &str = "/home/alice/sweep/b/b_run_1_completion_flag";

    #[tokio::test]
    async fn returns_once_flag_appears() {
        let (waiter, clock) = waiter(Some(4), 3600);
        let (_tx, mut cancel) = watch::channel(false);
        waiter.wait(FLAG, &mut cancel).await.unwrap();
        assert_eq!(clock.slept(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn times_out_when_flag_never_appears() {
        let (waiter, clock) = waiter(None, 60);
        let (_tx, mut cancel) = watch::channel(false);
        let err = waiter.wait(FLAG, &mut cancel).await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::DeadlineExceeded);
        assert_eq!(err.code(), codes::TIMEOUT);
        assert_eq!(clock.slept(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let (waiter, _clock) = waiter(None, 3600);
        let (tx, mut cancel) = watch::channel(false);
        tx.send(true).unwrap();
        let err = waiter.wait(FLAG, &mut cancel).await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::Cancelled);
    }
}
