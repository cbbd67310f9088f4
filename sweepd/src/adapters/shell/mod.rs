// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use async_trait::async_trait;
use sweepcore::errors::{AppError, AppErrorKind, AppResult, codes};
use sweepcore::exec::ExecCapture;
use tokio::process::Command;

use crate::app::ports::ShellPort;

/// Runs commands with `sh -c` on the machine the driver lives on.
#[derive(Clone)]
pub struct LocalShell {
    timeout: Duration,
}

impl LocalShell {
    /// Commands still running after `timeout` are killed and reported as failed.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ShellPort for LocalShell {
    #[tracing::instrument(name = "shell", level = "debug", skip(self))]
    async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture> {
        // The child dies with the dropped future when the timeout fires.
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| {
                AppError::with_message(
                    AppErrorKind::DeadlineExceeded,
                    codes::TIMEOUT,
                    format!("`{command}` did not finish within {:?}", self.timeout),
                )
            })?
            .map_err(|err| {
                AppError::with_message(
                    AppErrorKind::Internal,
                    codes::LOCAL_ERROR,
                    format!("failed to spawn `{command}`: {err}"),
                )
            })?;
        Ok(ExecCapture {
            stdout: output.stdout,
            stderr: output.stderr,
            // Killed by a signal: no exit code.
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn exec_capture_collects_streams_and_status() {
        let shell = LocalShell::new(Duration::from_secs(30));
        let capture = shell
            .exec_capture("printf 'out\\n'; printf 'err' >&2; exit 3")
            .await
            .unwrap();
        assert_eq!(capture.stdout_lines(), vec!["out"]);
        assert_eq!(capture.stderr_text(), "err");
        assert_eq!(capture.exit_code, 3);
    }

    #[tokio::test]
    async fn hung_command_is_cut_off() {
        let shell = LocalShell::new(Duration::from_millis(200));
        let started = Instant::now();
        let err = shell.exec_capture("sleep 30").await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(err.kind(), AppErrorKind::DeadlineExceeded);
        assert_eq!(err.code(), codes::TIMEOUT);
        assert!(err.message().contains("sleep 30"));
    }
}
