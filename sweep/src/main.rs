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

use adapters::ssh::{SessionManager, SshParams, SshRemote};
use app::completion::FlagFileWaiter;
use app::types::RunRequest;
use app::usecases::{Orchestrator, RunPlan};

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
        "config host: {}:{} (source={}, port source={})",
        report.host.value,
        report.port.value,
        report.host.source.as_str(),
        report.port.source.as_str()
    );
    tracing::info!(
        "config username: {} (source={})",
        report.username.value,
        report.username.source.as_str()
    );
    match &report.identity_path.value {
        Some(path) => tracing::info!(
            "config identity_path: {} (source={})",
            path.display(),
            report.identity_path.source.as_str()
        ),
        None => tracing::info!("config identity_path: (none)"),
    }
    tracing::info!(
        "config remote_root: {} (source={})",
        report.remote_root.value,
        report.remote_root.source.as_str()
    );
    tracing::info!(
        "config verbose: {} (source={})",
        report.verbose.value,
        report.verbose.source.as_str()
    );
    if let Some(path) = &report.log_file.value {
        tracing::info!(
            "config log_file: {} (source={})",
            path.display(),
            report.log_file.source.as_str()
        );
    }
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
    tracing::warn!("interrupted, the remote driver keeps running");
    let _ = cancel.send(true);
}

async fn run() -> anyhow::Result<ExitCode> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config.clone(),
        config::Overrides {
            host: opts.host.clone(),
            port: opts.port,
            username: opts.user.clone(),
            identity_path: opts.identity.clone(),
            log_file: opts.log_file.clone(),
            verbose: parsed.verbose_override,
        },
    )?;

    let plan = RunPlan::prepare(&RunRequest {
        archive_path: opts.archive.clone(),
        batch_name: opts.batch.clone(),
        output_dir: opts.output.clone(),
        run_index: opts.run_index,
    })?;
    let log_file = config
        .log_file
        .clone()
        .unwrap_or_else(|| plan.results.default_log_file());
    if let Some(parent) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    logging::init(&LogOptions {
        verbose: config.verbose,
        file: Some(log_file),
    });
    log_config_report(&report);
    tracing::info!(
        batch = plan.batch.name(),
        run_index = plan.run_index,
        jobs = plan.batch.job_count(),
        "sweep starting"
    );

    let addr = adapters::net::resolve_cluster(&config.host, config.port).await?;
    let session = Arc::new(SessionManager::new(SshParams {
        host: config.host.clone(),
        addr,
        username: config.username.clone(),
        identity_path: config.identity_path.clone(),
        password: config.password(),
        known_hosts_path: config.known_hosts_path.clone(),
        keepalive_secs: config.keepalive_secs,
    }));
    let remote = Arc::new(SshRemote::new(session));
    let clock = Arc::new(SystemClock::new());
    let waiter = Arc::new(FlagFileWaiter::new(
        remote.clone(),
        clock.clone(),
        config.completion_settings(),
    ));
    let orchestrator = Orchestrator::new(remote, waiter, clock, config.orchestrator_settings());

    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown_signals(cancel_tx));

    match orchestrator.run(&plan, &mut cancel_rx).await {
        Ok(outcome) => {
            tracing::info!(
                results = %outcome.results_dir.display(),
                entries = outcome.extracted_entries,
                "results retrieved"
            );
            println!("{}", outcome.results_dir.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("sweep: {err} [{}]", err.code());
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("sweep failed: {err:#}");
            eprintln!("sweep: {err:#}");
            ExitCode::FAILURE
        }
    }
}
