// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::time::Duration;

/// A run-level directory copied into every job's `input_files/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedInput {
    pub source: String,
    pub target: String,
}

/// How job directories are prepared and cleaned.
#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    /// Directory holding the simulation executable (and usually the driver itself).
    pub bundle_dir: PathBuf,
    pub executable: String,
    pub job_template: Option<PathBuf>,
    pub submission_script: String,
    pub queue_log_name: String,
    /// File names under `output_files/` removed once a job is done.
    pub scratch_files: Vec<String>,
    pub shared_inputs: Vec<SharedInput>,
}

/// Tunables of the submission, sweep and drain loops.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub max_parallel_jobs: usize,
    pub admission_poll: Duration,
    /// Run a cleanup sweep after this many submissions.
    pub sweep_every: usize,
    /// Minimum tracking age before a job missing from the queue counts as finished.
    pub assumption_window: Duration,
    pub drain_interval: Duration,
    pub drain_timeout: Duration,
    pub queue_owner: String,
    pub archive_exclude: Vec<String>,
    /// Driver log, appended to the result archive as its last entry.
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverReport {
    pub jobs: usize,
    pub submitted: usize,
    /// Refused by the queue or failed to materialize.
    pub rejected: usize,
    pub finished: usize,
    pub errored: usize,
    /// Still tracked when the driver gave up waiting.
    pub abandoned: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}
