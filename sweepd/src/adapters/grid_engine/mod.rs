// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sweepcore::model::{Job, QueueEntry};

use crate::app::ports::{QueueError, QueuePort, ShellPort, SubmitReceipt};
use crate::app::services::grid_engine;

/// [`QueuePort`] on top of the qstat/qsub/qdel command line tools.
pub struct GridEngineQueue {
    shell: Arc<dyn ShellPort>,
}

impl GridEngineQueue {
    pub fn new(shell: Arc<dyn ShellPort>) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl QueuePort for GridEngineQueue {
    async fn list_jobs(&self, owner: &str) -> Result<Vec<QueueEntry>, QueueError> {
        let command = grid_engine::list_command(owner);
        let capture = self
            .shell
            .exec_capture(&command)
            .await
            .map_err(|err| QueueError::Command {
                command: command.clone(),
                message: err.to_string(),
            })?;
        if !capture.success() {
            return Err(QueueError::Command {
                command,
                message: format!("exit code {}: {}", capture.exit_code, capture.stderr_text()),
            });
        }
        let stdout = String::from_utf8_lossy(&capture.stdout);
        Ok(grid_engine::parse_qstat(&stdout)?)
    }

    async fn submit(&self, job: &Job, script: &Path) -> Result<SubmitReceipt, QueueError> {
        let command = grid_engine::submit_command(job.directory(), script);
        let capture = self
            .shell
            .exec_capture(&command)
            .await
            .map_err(|err| QueueError::Command {
                command: command.clone(),
                message: err.to_string(),
            })?;
        let stdout = String::from_utf8_lossy(&capture.stdout).to_string();
        let stderr = capture.stderr_text();
        if grid_engine::is_rejection(&stdout) || grid_engine::is_rejection(&stderr) {
            let message = if stdout.trim().is_empty() { stderr } else { stdout.trim().to_string() };
            return Err(QueueError::Rejected {
                queue_name: job.queue_name().to_string(),
                message,
            });
        }
        if !capture.success() {
            return Err(QueueError::Command {
                command,
                message: format!("exit code {}: {}", capture.exit_code, stderr),
            });
        }
        Ok(SubmitReceipt {
            queue_name: job.queue_name().to_string(),
            queue_id: grid_engine::parse_submit_response(&stdout),
        })
    }

    async fn cancel(&self, queue_id: u64) {
        let command = grid_engine::cancel_command(queue_id);
        match self.shell.exec_capture(&command).await {
            Ok(capture) if capture.success() => {
                tracing::info!(queue_id, "cancelled job");
            }
            Ok(capture) => {
                tracing::warn!(
                    queue_id,
                    exit_code = capture.exit_code,
                    stderr = %capture.stderr_text(),
                    "cancel command failed"
                );
            }
            Err(err) => {
                tracing::warn!(queue_id, "cancel command could not run: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use sweepcore::errors::AppResult;
    use sweepcore::exec::ExecCapture;
    use sweepcore::model::QueueState;

    struct SequencedShell {
        captures: Mutex<VecDeque<(String, AppResult<ExecCapture>)>>,
    }

    impl SequencedShell {
        fn new(captures: Vec<(String, AppResult<ExecCapture>)>) -> Self {
            Self {
                captures: Mutex::new(VecDeque::from(captures)),
            }
        }
    }

    #[async_trait]
    impl ShellPort for SequencedShell {
        async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture> {
            let mut captures = self.captures.lock().expect("captures lock");
            let Some((expected, result)) = captures.pop_front() else {
                panic!("unexpected command: {command}");
            };
            assert_eq!(command, expected);
            result
        }
    }

    fn capture(exit_code: i32, stdout: &str, stderr: &str) -> AppResult<ExecCapture> {
        Ok(ExecCapture {
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code,
        })
    }

    fn job() -> Job {
        Job::new("lattice", PathBuf::from("/runs/lattice_run_1/jobs/a")).unwrap()
    }

    const SCRIPT: &str = "/runs/lattice_run_1/jobs/a/job_submission_script.sh";
    const SUBMIT: &str = "qsub -j y -o '/runs/lattice_run_1/jobs/a' '/runs/lattice_run_1/jobs/a/job_submission_script.sh'";

    #[tokio::test]
    async fn list_jobs_parses_listing() {
        let shell = SequencedShell::new(vec![(
            "qstat -u 'alice' -r".to_string(),
            capture(
                0,
                " 11 0.5 lattice_a alice r 08/14/2024 10:22:05 all.q 1\n   Full jobname: lattice_a\n",
                "",
            ),
        )]);
        let queue = GridEngineQueue::new(Arc::new(shell));
        let entries = queue.list_jobs("alice").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "lattice_a");
        assert_eq!(entries[0].state, QueueState::Running);
    }

    #[tokio::test]
    async fn list_jobs_surfaces_parse_errors() {
        let shell = SequencedShell::new(vec![(
            "qstat -u 'alice' -r".to_string(),
            capture(0, " 11 0.5 lattice_a\n", ""),
        )]);
        let queue = GridEngineQueue::new(Arc::new(shell));
        let err = queue.list_jobs("alice").await.unwrap_err();
        assert!(matches!(err, QueueError::Parse(_)));
    }

    #[tokio::test]
    async fn list_jobs_reports_failed_command() {
        let shell = SequencedShell::new(vec![(
            "qstat -u 'alice' -r".to_string(),
            capture(1, "", "qstat: cannot reach qmaster"),
        )]);
        let queue = GridEngineQueue::new(Arc::new(shell));
        let err = queue.list_jobs("alice").await.unwrap_err();
        assert!(err.to_string().contains("cannot reach qmaster"));
    }

    #[tokio::test]
    async fn submit_returns_receipt_with_id() {
        let shell = SequencedShell::new(vec![(
            SUBMIT.to_string(),
            capture(0, "Your job 9001 (\"lattice_a\") has been submitted\n", ""),
        )]);
        let queue = GridEngineQueue::new(Arc::new(shell));
        let receipt = queue.submit(&job(), Path::new(SCRIPT)).await.unwrap();
        assert_eq!(
            receipt,
            SubmitReceipt {
                queue_name: "lattice_a".to_string(),
                queue_id: Some(9001),
            }
        );
    }

    #[tokio::test]
    async fn submit_detects_rejection_marker() {
        let shell = SequencedShell::new(vec![(
            SUBMIT.to_string(),
            capture(1, "", "Unable to run job: job rejected: the requested queue does not exist.\n"),
        )]);
        let queue = GridEngineQueue::new(Arc::new(shell));
        let err = queue.submit(&job(), Path::new(SCRIPT)).await.unwrap_err();
        match err {
            QueueError::Rejected { queue_name, message } => {
                assert_eq!(queue_name, "lattice_a");
                assert!(message.starts_with("Unable to run job"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    /// Every command stalls like qstat against an unresponsive qmaster.
    #[cfg(unix)]
    struct StalledShell {
        inner: crate::adapters::shell::LocalShell,
    }

    #[cfg(unix)]
    #[async_trait]
    impl ShellPort for StalledShell {
        async fn exec_capture(&self, _command: &str) -> AppResult<ExecCapture> {
            self.inner.exec_capture("sleep 30").await
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stalled_commands_fail_instead_of_blocking() {
        let shell = StalledShell {
            inner: crate::adapters::shell::LocalShell::new(std::time::Duration::from_millis(200)),
        };
        let queue = GridEngineQueue::new(Arc::new(shell));
        let started = std::time::Instant::now();

        let err = queue.list_jobs("alice").await.unwrap_err();
        assert!(matches!(err, QueueError::Command { .. }));
        assert!(err.to_string().contains("did not finish"));

        let err = queue.submit(&job(), Path::new(SCRIPT)).await.unwrap_err();
        assert!(matches!(err, QueueError::Command { .. }));

        queue.cancel(5).await;
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancel_swallows_failures() {
        let shell = SequencedShell::new(vec![
            ("qdel -f 5".to_string(), capture(1, "", "denied")),
            ("qdel -f 6".to_string(), capture(0, "", "")),
        ]);
        let shell = Arc::new(shell);
        let queue = GridEngineQueue::new(shell.clone());
        queue.cancel(5).await;
        queue.cancel(6).await;
        assert!(shell.captures.lock().expect("captures lock").is_empty());
    }
}
