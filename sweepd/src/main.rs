// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use sweepcore::clock::SystemClock;
use sweepcore::logging::{self, LogOptions};
use tokio::sync::watch;

mod adapters;
mod app;
mod config;

use app::driver::RemoteDriver;
use app::services::workspace::{DRIVER_LOG_NAME, JobWorkspace, abandon_run};

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => {
            tracing::info!(
                "config path: {} (source={}, present={})",
                path.display(),
                source.as_str(),
                report.config_file_present
            );
        }
        (Some(path), None) => {
            tracing::info!(
                "config path: {} (present={})",
                path.display(),
                report.config_file_present
            );
        }
        (None, _) => {
            tracing::info!("config path: (none)");
        }
    }
    tracing::info!(
        "config bundle_dir: {} (source={})",
        report.bundle_dir.value.display(),
        report.bundle_dir.source.as_str()
    );
    tracing::info!(
        "config max_parallel_jobs: {} (source={})",
        report.max_parallel_jobs.value,
        report.max_parallel_jobs.source.as_str()
    );
    tracing::info!(
        "config drain_timeout_secs: {} (source={})",
        report.drain_timeout_secs.value,
        report.drain_timeout_secs.source.as_str()
    );
    tracing::info!(
        "config queue_owner: {} (source={})",
        report.queue_owner.value,
        report.queue_owner.source.as_str()
    );
    tracing::info!(
        "config verbose: {} (source={})",
        report.verbose.value,
        report.verbose.source.as_str()
    );
}

/// Flips the cancel flag on Ctrl-C or SIGTERM.
async fn forward_shutdown_signals(cancel: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!("cannot listen for SIGTERM: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::warn!("shutdown requested, skipping to teardown");
    let _ = cancel.send(true);
}

/// Everything the driver needs before it can start.
fn prepare(
    opts: &adapters::cli::Opts,
    loaded: anyhow::Result<config::LoadResult>,
    run_dir: &std::path::Path,
) -> anyhow::Result<(config::Config, JobWorkspace)> {
    let config::LoadResult { config, report } = loaded?;
    log_config_report(&report);
    let batch = opts
        .batch_name()
        .context("cannot derive the batch name from --run-dir; pass --batch")?;
    tracing::info!(run_dir = %run_dir.display(), batch = %batch, "sweepd starting");
    let workspace = JobWorkspace::new(run_dir.to_path_buf(), batch, config.workspace_settings())?;
    Ok((config, workspace))
}

async fn run() -> anyhow::Result<ExitCode> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let run_dir = std::path::absolute(&opts.run_dir)
        .with_context(|| format!("invalid run directory {}", opts.run_dir.display()))?;
    let log_file = run_dir.join(DRIVER_LOG_NAME);

    let loaded = config::load_with_report(
        opts.config.clone(),
        config::Overrides {
            max_parallel_jobs: opts.max_parallel_jobs,
            drain_timeout_secs: opts.drain_timeout_secs,
            queue_owner: opts.queue_owner.clone(),
            verbose: parsed.verbose_override,
        },
    );
    let verbose = match &loaded {
        Ok(loaded) => loaded.config.verbose,
        Err(_) => parsed.verbose_override.unwrap_or(false),
    };
    logging::init(&LogOptions {
        verbose,
        file: Some(log_file.clone()),
    });

    let (config, workspace) = match prepare(&opts, loaded, &run_dir) {
        Ok(prepared) => prepared,
        Err(err) => {
            // stderr goes to /dev/null; the archived log is the only report.
            tracing::error!("sweepd cannot start: {err:#}");
            match abandon_run(&run_dir, Some(&log_file)).await {
                Ok(flag) => tracing::info!(flag = %flag.display(), "completion signalled"),
                Err(err) => tracing::error!(code = err.code(), "teardown failed: {err}"),
            }
            return Ok(ExitCode::FAILURE);
        }
    };

    let shell = Arc::new(adapters::shell::LocalShell::new(config.command_timeout()));
    let queue = Arc::new(adapters::grid_engine::GridEngineQueue::new(shell));
    let clock = Arc::new(SystemClock::new());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown_signals(cancel_tx));

    let mut driver = RemoteDriver::new(
        config.driver_settings(Some(log_file)),
        workspace,
        queue,
        clock,
        cancel_rx,
    );
    match driver.run().await {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("sweepd failed: {err:#}");
            eprintln!("sweepd: {err:#}");
            ExitCode::FAILURE
        }
    }
}
