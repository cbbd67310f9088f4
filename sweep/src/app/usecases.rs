// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! End-to-end lifecycle of one run, as seen from the controller:
//! connect, bootstrap the driver, stage the batch, launch, wait, retrieve.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use sweepcore::archive;
use sweepcore::clock::ClockPort;
use sweepcore::errors::{AppError, AppErrorKind, AppResult, codes};
use sweepcore::layout::{DRIVER_BINARY, LocalResults, RunLayout, next_run_index, resolve_remote_root};
use sweepcore::model::Batch;
use sweepcore::shell::sh_escape;
use tokio::sync::watch;

use crate::app::completion::CompletionWaiter;
use crate::app::ports::RemotePort;
use crate::app::services::{bundle, history};
use crate::app::types::{OrchestratorSettings, RunOutcome, RunRequest};

pub const HOME_COMMAND: &str = r#"printf '%s' "$HOME""#;

fn enter_phase(phase: &'static str) {
    tracing::info!(phase, "phase transition");
}

/// Everything that can be checked before touching the network.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub batch: Batch,
    pub run_index: u32,
    pub results: LocalResults,
}

impl RunPlan {
    /// Opens the batch archive, picks the run index and creates the local
    /// batch directory (the controller log lives there).
    pub fn prepare(request: &RunRequest) -> AppResult<Self> {
        let batch = Batch::open(&request.archive_path, request.batch_name.as_deref())?;
        let run_index = match request.run_index {
            Some(0) => {
                return Err(AppError::with_message(
                    AppErrorKind::InvalidArgument,
                    codes::INVALID_ARGUMENT,
                    "run index starts at 1",
                ));
            }
            Some(index) => index,
            None => next_run_index(&request.output_dir, batch.name()).map_err(|err| {
                AppError::local_io("failed to scan", &request.output_dir, err)
            })?,
        };
        let results = LocalResults::new(&request.output_dir, batch.name(), run_index);
        if results.extract_dir().exists() {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                format!(
                    "results for run {run_index} already exist at {}",
                    results.extract_dir().display()
                ),
            ));
        }
        let batch_dir = results.batch_dir();
        fs::create_dir_all(&batch_dir)
            .map_err(|err| AppError::local_io("failed to create", &batch_dir, err))?;
        Ok(Self {
            batch,
            run_index,
            results,
        })
    }
}

pub fn install_command(layout: &RunLayout) -> String {
    let upload = layout.driver_upload();
    format!(
        "cd {} && unzip -o -q {} && rm -f {} && chmod 755 {DRIVER_BINARY}",
        sh_escape(layout.root()),
        sh_escape(&upload),
        sh_escape(&upload),
    )
}

/// Detached: the driver outlives this SSH session.
pub fn launch_command(layout: &RunLayout, batch: &str) -> String {
    format!(
        "cd {} && nohup ./{DRIVER_BINARY} --run-dir {} --batch {} > /dev/null 2>&1 < /dev/null &",
        sh_escape(layout.root()),
        sh_escape(&layout.run_dir()),
        sh_escape(batch),
    )
}

pub struct Orchestrator {
    remote: Arc<dyn RemotePort>,
    waiter: Arc<dyn CompletionWaiter>,
    clock: Arc<dyn ClockPort>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        remote: Arc<dyn RemotePort>,
        waiter: Arc<dyn CompletionWaiter>,
        clock: Arc<dyn ClockPort>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            remote,
            waiter,
            clock,
            settings,
        }
    }

    pub async fn run(&self, plan: &RunPlan, cancel: &mut watch::Receiver<bool>) -> AppResult<RunOutcome> {
        let outcome = self.run_connected(plan, cancel).await;
        self.remote.disconnect().await;
        if let Err(err) = &outcome {
            tracing::error!(code = err.code(), "run failed: {err}");
        }
        outcome
    }

    async fn run_connected(
        &self,
        plan: &RunPlan,
        cancel: &mut watch::Receiver<bool>,
    ) -> AppResult<RunOutcome> {
        let batch = plan.batch.name();
        tracing::info!(
            batch,
            run_index = plan.run_index,
            jobs = plan.batch.job_count(),
            archive = %plan.batch.archive_path().display(),
            "starting run"
        );

        enter_phase("connect");
        self.remote.connect().await?;
        let home = self.remote_home().await?;
        let layout = RunLayout::new(
            resolve_remote_root(&home, &self.settings.remote_root),
            batch,
            plan.run_index,
        );

        enter_phase("bootstrap");
        self.bootstrap(&layout).await?;

        enter_phase("stage");
        self.stage(plan, &layout).await?;

        enter_phase("launch");
        self.launch(&layout, batch).await?;
        if let Err(err) = history::append(
            &plan.results.history_file(),
            self.clock.now_utc(),
            batch,
            plan.run_index,
        ) {
            tracing::warn!("failed to record run in history: {err}");
        }

        enter_phase("wait");
        self.waiter.wait(&layout.completion_flag(), cancel).await?;

        enter_phase("retrieve");
        let extracted_entries = self.retrieve(plan, &layout).await?;

        enter_phase("done");
        tracing::info!(
            results = %plan.results.extract_dir().display(),
            extracted_entries,
            "run complete"
        );
        Ok(RunOutcome {
            batch: batch.to_string(),
            run_index: plan.run_index,
            jobs: plan.batch.job_count(),
            results_dir: plan.results.extract_dir(),
            extracted_entries,
        })
    }

    async fn remote_home(&self) -> AppResult<String> {
        let capture = self.remote.run(HOME_COMMAND).await?;
        let home = String::from_utf8_lossy(&capture.stdout).trim().to_string();
        if !capture.success() || !home.starts_with('/') {
            return Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::REMOTE_ERROR,
                format!(
                    "cannot determine remote home directory (exit {}): {}",
                    capture.exit_code,
                    capture.stderr_text()
                ),
            ));
        }
        Ok(home)
    }

    async fn bootstrap(&self, layout: &RunLayout) -> AppResult<()> {
        self.remote.ensure_landed(layout.root()).await?;
        if self.remote.exists(&layout.driver_binary()).await? {
            tracing::info!(driver = %layout.driver_binary(), "driver already installed");
            return Ok(());
        }
        let bundle_dir = self.settings.driver_bundle.as_deref().ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!(
                    "driver is not installed at {} and no driver_bundle is configured",
                    layout.driver_binary()
                ),
            )
        })?;
        tracing::info!(bundle = %bundle_dir.display(), root = layout.root(), "installing driver");
        let packed = bundle::pack(bundle_dir).await?;
        self.remote.put(packed.path(), &layout.driver_upload()).await?;
        let capture = self.remote.run(&install_command(layout)).await?;
        if !capture.success() {
            return Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::REMOTE_ERROR,
                format!(
                    "failed to unpack driver bundle (exit {}): {}",
                    capture.exit_code,
                    capture.stderr_text()
                ),
            ));
        }
        Ok(())
    }

    async fn stage(&self, plan: &RunPlan, layout: &RunLayout) -> AppResult<()> {
        for leftover in [layout.run_dir(), layout.result_archive(), layout.completion_flag()] {
            if self.remote.exists(&leftover).await? {
                return Err(AppError::with_message(
                    AppErrorKind::InvalidArgument,
                    codes::INVALID_ARGUMENT,
                    format!(
                        "remote {leftover} already exists; pass --run-index {} or clean it up",
                        plan.run_index.saturating_add(1)
                    ),
                ));
            }
        }
        self.remote.ensure_landed(&layout.run_dir()).await?;
        self.remote
            .put(plan.batch.archive_path(), &layout.batch_upload())
            .await?;
        tracing::info!(upload = %layout.batch_upload(), "batch archive staged");
        Ok(())
    }

    async fn launch(&self, layout: &RunLayout, batch: &str) -> AppResult<()> {
        let capture = self.remote.run(&launch_command(layout, batch)).await?;
        if !capture.success() {
            return Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::REMOTE_ERROR,
                format!(
                    "failed to launch driver (exit {}): {}",
                    capture.exit_code,
                    capture.stderr_text()
                ),
            ));
        }
        tracing::info!(run_dir = %layout.run_dir(), "driver launched");
        Ok(())
    }

    async fn retrieve(&self, plan: &RunPlan, layout: &RunLayout) -> AppResult<usize> {
        let download = plan.results.download_path();
        self.remote.get(&layout.result_archive(), &download).await?;
        self.remote.remove_file(&layout.result_archive()).await?;
        self.remote.remove_file(&layout.completion_flag()).await?;
        let entries = extract_results(download.clone(), plan.results.extract_dir()).await?;
        fs::remove_file(&download).map_err(|err| AppError::local_io("failed to remove", &download, err))?;
        Ok(entries)
    }
}

async fn extract_results(archive_path: PathBuf, dest: PathBuf) -> AppResult<usize> {
    tokio::task::spawn_blocking(move || archive::extract(&archive_path, &dest))
        .await
        .map_err(|err| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::INTERNAL_ERROR,
                format!("extract task failed: {err}"),
            )
        })?
        .map_err(|err| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::ARCHIVE_ERROR,
                format!("failed to extract results: {err}"),
            )
        })
}
