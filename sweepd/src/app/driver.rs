// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Admission-controlled submission of a batch and the cleanup that follows it.
//!
//! Per job: pending, submitted, then finished (gone from the queue for at
//! least the assumption window) or errored (seen in an error state and
//! cancelled). Teardown always archives whatever exists and writes the
//! completion flag, even after a failure.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use sweepcore::clock::{ClockPort, sleep_or_cancel, to_time_duration};
use sweepcore::errors::{AppError, AppErrorKind, AppResult, codes};
use sweepcore::model::{Job, QueueEntry, SubmittedJob};
use tokio::sync::watch;

use crate::app::ports::QueuePort;
use crate::app::services::workspace::{JobWorkspace, run_excludes};
use crate::app::types::{DriverReport, DriverSettings};

pub struct RemoteDriver {
    settings: DriverSettings,
    workspace: JobWorkspace,
    queue: Arc<dyn QueuePort>,
    clock: Arc<dyn ClockPort>,
    cancel: watch::Receiver<bool>,
    /// Keyed by queue name; one entry per job at most.
    tracked: BTreeMap<String, SubmittedJob>,
    /// Queue names of every job in this run, used to pick our entries out of a shared queue.
    own_names: HashSet<String>,
    report: DriverReport,
}

fn enter_phase(phase: &'static str) {
    tracing::info!(phase, "phase transition");
}

impl RemoteDriver {
    pub fn new(
        settings: DriverSettings,
        workspace: JobWorkspace,
        queue: Arc<dyn QueuePort>,
        clock: Arc<dyn ClockPort>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            settings,
            workspace,
            queue,
            clock,
            cancel,
            tracked: BTreeMap::new(),
            own_names: HashSet::new(),
            report: DriverReport::default(),
        }
    }

    /// Runs the whole lifecycle. Teardown happens regardless of how the main
    /// phase ended; the first error wins.
    pub async fn run(&mut self) -> AppResult<DriverReport> {
        let outcome = self.execute().await;
        if let Err(err) = &outcome {
            tracing::error!(code = err.code(), "driver failed: {err}");
        }
        let teardown = self.teardown().await;
        if let Err(err) = &teardown {
            tracing::error!(code = err.code(), "teardown failed: {err}");
        }
        outcome?;
        teardown?;
        Ok(self.report.clone())
    }

    async fn execute(&mut self) -> AppResult<()> {
        enter_phase("preflight");
        self.workspace.check_parent_writable()?;

        enter_phase("unpack");
        self.workspace.unpack_batch().await?;
        let jobs = self.workspace.discover_jobs()?;
        self.report.jobs = jobs.len();
        let jobs = self.drop_queue_name_clashes(jobs);
        self.own_names = jobs.iter().map(|job| job.queue_name().to_string()).collect();
        tracing::info!(jobs = jobs.len(), batch = self.workspace.batch_name(), "batch unpacked");

        enter_phase("submit");
        self.submit_all(&jobs).await;
        if self.report.cancelled {
            return Err(cancelled());
        }

        enter_phase("drain");
        self.drain().await;
        if self.report.cancelled {
            return Err(cancelled());
        }
        Ok(())
    }

    /// Distinct directories can sanitize to one queue name, which would make
    /// their queue entries indistinguishable. Only the first in name order runs.
    fn drop_queue_name_clashes(&mut self, jobs: Vec<Job>) -> Vec<Job> {
        let mut owners: HashMap<String, String> = HashMap::new();
        let mut kept = Vec::with_capacity(jobs.len());
        for job in jobs {
            if let Some(first) = owners.get(job.queue_name()) {
                tracing::error!(
                    job = job.id(),
                    clashes_with = %first,
                    queue_name = job.queue_name(),
                    "queue name already taken, job not submitted"
                );
                self.report.rejected += 1;
                continue;
            }
            owners.insert(job.queue_name().to_string(), job.id().to_string());
            kept.push(job);
        }
        kept
    }

    async fn submit_all(&mut self, jobs: &[Job]) {
        let sweep_every = self.settings.sweep_every.max(1);
        for (index, job) in jobs.iter().enumerate() {
            if self.is_cancelled() || !self.wait_for_slot().await {
                self.report.cancelled = true;
                tracing::warn!(remaining = jobs.len() - index, "submission interrupted");
                return;
            }
            self.submit_one(job).await;
            if (index + 1) % sweep_every == 0 {
                self.clean_finished_jobs(true).await;
            }
        }
    }

    /// Blocks until fewer than `max_parallel_jobs` of our jobs are in flight.
    /// Returns `false` when cancelled while waiting.
    async fn wait_for_slot(&mut self) -> bool {
        let max = self.settings.max_parallel_jobs.max(1);
        loop {
            match self.queue.list_jobs(&self.settings.queue_owner).await {
                Ok(snapshot) => {
                    if self.in_flight(&snapshot) < max {
                        return true;
                    }
                    // Blocked anyway: let finished jobs give their slot back.
                    self.sweep(&snapshot, true).await;
                    let in_flight = self.in_flight(&snapshot);
                    if in_flight < max {
                        return true;
                    }
                    tracing::debug!(in_flight, max, "admission blocked");
                }
                Err(err) => {
                    tracing::warn!("queue state unknown this tick: {err}");
                }
            }
            if !sleep_or_cancel(
                self.clock.as_ref(),
                self.settings.admission_poll,
                &mut self.cancel,
            )
            .await
            {
                return false;
            }
        }
    }

    /// Our jobs visible in the queue plus tracked jobs that may not be visible yet.
    fn in_flight(&self, snapshot: &[QueueEntry]) -> usize {
        let mut names: HashSet<&str> = snapshot
            .iter()
            .map(|entry| entry.name.as_str())
            .filter(|name| self.own_names.contains(*name))
            .collect();
        names.extend(self.tracked.keys().map(String::as_str));
        names.len()
    }

    async fn submit_one(&mut self, job: &Job) {
        let script = match self.workspace.materialize(job) {
            Ok(script) => script,
            Err(err) => {
                tracing::error!(job = job.id(), "failed to prepare job, abandoning it: {err}");
                self.report.rejected += 1;
                return;
            }
        };
        match self.queue.submit(job, &script).await {
            Ok(receipt) => {
                tracing::info!(
                    job = job.id(),
                    queue_name = %receipt.queue_name,
                    queue_id = ?receipt.queue_id,
                    "submitted"
                );
                self.tracked.insert(
                    job.queue_name().to_string(),
                    SubmittedJob {
                        job: job.clone(),
                        submitted_at: self.clock.now_utc(),
                        queue_id: receipt.queue_id,
                    },
                );
                self.report.submitted += 1;
            }
            Err(err) => {
                tracing::error!(job = job.id(), "submission failed, job abandoned: {err}");
                self.report.rejected += 1;
            }
        }
    }

    /// Fetches a snapshot and sweeps it. A failed listing skips this sweep.
    async fn clean_finished_jobs(&mut self, respect_window: bool) {
        match self.queue.list_jobs(&self.settings.queue_owner).await {
            Ok(snapshot) => self.sweep(&snapshot, respect_window).await,
            Err(err) => tracing::warn!("skipping cleanup sweep, queue state unknown: {err}"),
        }
    }

    async fn sweep(&mut self, snapshot: &[QueueEntry], respect_window: bool) {
        for entry in snapshot
            .iter()
            .filter(|entry| entry.is_error() && self.own_names.contains(&entry.name))
        {
            tracing::warn!(
                queue_id = entry.queue_id,
                queue_name = %entry.name,
                state = %entry.state_code,
                "job is in an error state, cancelling"
            );
            self.queue.cancel(entry.queue_id).await;
            if let Some(submitted) = self.tracked.remove(&entry.name) {
                self.report.errored += 1;
                self.retire(&submitted.job);
            }
        }

        let now = self.clock.now_utc();
        let window = to_time_duration(self.settings.assumption_window);
        let in_queue: HashSet<&str> = snapshot.iter().map(|entry| entry.name.as_str()).collect();
        let finished: Vec<String> = self
            .tracked
            .iter()
            .filter(|(name, submitted)| {
                !in_queue.contains(name.as_str()) && (!respect_window || submitted.age(now) >= window)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in finished {
            if let Some(submitted) = self.tracked.remove(&name) {
                tracing::info!(job = submitted.job.id(), "job finished");
                self.report.finished += 1;
                self.retire(&submitted.job);
            }
        }
    }

    /// Moves the queue log into place and frees scratch space. Problems are logged only.
    fn retire(&self, job: &Job) {
        match self.workspace.harvest_queue_log(job) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job = job.id(), "queue log not found, reclaiming scratch anyway");
            }
            Err(err) => {
                tracing::warn!(job = job.id(), "failed to harvest queue log: {err}");
            }
        }
        match self.workspace.reclaim(job) {
            Ok(removed) => tracing::debug!(job = job.id(), removed, "scratch reclaimed"),
            Err(err) => tracing::warn!(job = job.id(), "failed to reclaim scratch: {err}"),
        }
    }

    async fn drain(&mut self) {
        let started = self.clock.now_utc();
        let timeout = to_time_duration(self.settings.drain_timeout);
        while !self.tracked.is_empty() {
            if self.clock.now_utc() - started >= timeout {
                tracing::error!(
                    remaining = self.tracked.len(),
                    timeout_secs = self.settings.drain_timeout.as_secs(),
                    "drain timeout reached, archiving what is there"
                );
                self.report.timed_out = true;
                return;
            }
            if !sleep_or_cancel(
                self.clock.as_ref(),
                self.settings.drain_interval,
                &mut self.cancel,
            )
            .await
            {
                self.report.cancelled = true;
                return;
            }
            self.clean_finished_jobs(true).await;
        }
    }

    fn log_report(&self) {
        let report = &self.report;
        tracing::info!(
            jobs = report.jobs,
            submitted = report.submitted,
            rejected = report.rejected,
            finished = report.finished,
            errored = report.errored,
            abandoned = report.abandoned,
            timed_out = report.timed_out,
            cancelled = report.cancelled,
            "driver report"
        );
    }

    async fn teardown(&mut self) -> AppResult<()> {
        if !self.own_names.is_empty() {
            enter_phase("final_sweep");
            self.clean_finished_jobs(false).await;
        }
        self.report.abandoned = self.tracked.len();
        if self.report.abandoned > 0 {
            tracing::warn!(
                abandoned = self.report.abandoned,
                "jobs still queued at teardown are left running"
            );
        }

        enter_phase("emergency_clean");
        match self.workspace.emergency_clean() {
            Ok(removed) => tracing::info!(removed, "emergency clean done"),
            Err(err) => tracing::warn!("emergency clean failed: {err}"),
        }
        // Logged before archiving so the archived log carries it.
        self.log_report();

        enter_phase("archive");
        let mut outcome = self.archive().await;
        if outcome.is_ok() {
            outcome = self.workspace.remove_run_dir();
        }

        // The controller waits on the flag, so it is written even when archiving failed.
        enter_phase("signal");
        let signalled = self
            .workspace
            .signal_completion()
            .map(|flag| tracing::info!(flag = %flag.display(), "completion signalled"));
        outcome.and(signalled)
    }

    async fn archive(&self) -> AppResult<()> {
        let log_file = self.settings.log_file.as_deref();
        let excludes = run_excludes(
            self.workspace.run_dir(),
            &self.settings.archive_exclude,
            log_file,
        )?;
        self.workspace.archive(&excludes, log_file).await?;
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

fn cancelled() -> AppError {
    AppError::with_message(AppErrorKind::Cancelled, codes::CANCELED, "driver cancelled")
}
