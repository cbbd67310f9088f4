// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::time::Duration;

/// How the controller deploys and starts the driver.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Relative to the remote home unless absolute.
    pub remote_root: String,
    /// Local directory zipped and uploaded when the driver is missing remotely.
    pub driver_bundle: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// One submission of a batch.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub archive_path: PathBuf,
    /// Defaults to the archive's file stem.
    pub batch_name: Option<String>,
    pub output_dir: PathBuf,
    /// Next free index under the output directory when absent.
    pub run_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub batch: String,
    pub run_index: u32,
    pub jobs: usize,
    pub results_dir: PathBuf,
    pub extracted_entries: usize,
}
