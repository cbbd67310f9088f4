// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Where a run lives on the cluster and where its results land locally.
//!
//! Remote paths are POSIX strings regardless of the controller's platform.

use std::io;
use std::path::{Path, PathBuf};

use crate::model::{ARCHIVE_EXTENSION, COMPLETION_FLAG_SUFFIX};

pub const DRIVER_BINARY: &str = "sweepd";
pub const DRIVER_BUNDLE_UPLOAD: &str = "sweep-driver.zip";
pub const JOBS_DIR: &str = "jobs";
pub const LOCAL_RUN_PREFIX: &str = "run_";
pub const HISTORY_FILE: &str = "batch_log.csv";

pub fn run_name(batch: &str, run_index: u32) -> String {
    format!("{batch}_run_{run_index}")
}

pub fn join_remote(base: &str, child: &str) -> String {
    let child = child.trim_start_matches('/');
    if base.is_empty() {
        return child.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), child)
}

/// Absolute remote root: `configured` itself when absolute, otherwise under `home`.
pub fn resolve_remote_root(home: &str, configured: &str) -> String {
    let configured = configured.trim();
    if configured.starts_with('/') {
        configured.trim_end_matches('/').to_string()
    } else if configured.is_empty() || configured == "." {
        home.trim_end_matches('/').to_string()
    } else {
        join_remote(home, configured.trim_end_matches('/'))
    }
}

/// Remote layout of one run:
/// `<root>/<batch>/<batch>_run_<n>/` with the result archive and completion
/// flag beside it, and the driver installed directly under `<root>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: String,
    batch: String,
    run_index: u32,
}

impl RunLayout {
    pub fn new(root: impl Into<String>, batch: impl Into<String>, run_index: u32) -> Self {
        Self {
            root: root.into(),
            batch: batch.into(),
            run_index,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn run_index(&self) -> u32 {
        self.run_index
    }

    pub fn run_name(&self) -> String {
        run_name(&self.batch, self.run_index)
    }

    pub fn batch_dir(&self) -> String {
        join_remote(&self.root, &self.batch)
    }

    pub fn run_dir(&self) -> String {
        join_remote(&self.batch_dir(), &self.run_name())
    }

    /// Where the batch archive is uploaded, inside the run directory.
    pub fn batch_upload(&self) -> String {
        join_remote(&self.run_dir(), &format!("{}.{ARCHIVE_EXTENSION}", self.batch))
    }

    pub fn result_archive(&self) -> String {
        format!("{}.{ARCHIVE_EXTENSION}", self.run_dir())
    }

    pub fn completion_flag(&self) -> String {
        format!("{}{COMPLETION_FLAG_SUFFIX}", self.run_dir())
    }

    pub fn driver_binary(&self) -> String {
        join_remote(&self.root, DRIVER_BINARY)
    }

    pub fn driver_upload(&self) -> String {
        join_remote(&self.root, DRIVER_BUNDLE_UPLOAD)
    }
}

/// Local layout of retrieved results: `<output>/<batch>/run_<n>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalResults {
    output_dir: PathBuf,
    batch: String,
    run_index: u32,
}

impl LocalResults {
    pub fn new(output_dir: impl Into<PathBuf>, batch: impl Into<String>, run_index: u32) -> Self {
        Self {
            output_dir: output_dir.into(),
            batch: batch.into(),
            run_index,
        }
    }

    pub fn batch_dir(&self) -> PathBuf {
        self.output_dir.join(&self.batch)
    }

    pub fn download_path(&self) -> PathBuf {
        self.batch_dir().join(format!(
            "{}.{ARCHIVE_EXTENSION}",
            run_name(&self.batch, self.run_index)
        ))
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.batch_dir()
            .join(format!("{LOCAL_RUN_PREFIX}{}", self.run_index))
    }

    pub fn default_log_file(&self) -> PathBuf {
        self.batch_dir()
            .join(format!("{}.log", run_name(&self.batch, self.run_index)))
    }

    pub fn history_file(&self) -> PathBuf {
        self.output_dir.join(HISTORY_FILE)
    }
}

/// One past the highest run index seen for `batch`, or 1. Both the local
/// `run_<k>` directories and the launches recorded in the history file
/// count, so a run that never came back is not reused.
pub fn next_run_index(output_dir: &Path, batch: &str) -> io::Result<u32> {
    let highest = highest_local_run(&output_dir.join(batch))?
        .max(highest_launched_run(&output_dir.join(HISTORY_FILE), batch)?);
    Ok(highest.saturating_add(1))
}

fn highest_local_run(dir: &Path) -> io::Result<u32> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    let mut highest = 0u32;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(index) = name
            .strip_prefix(LOCAL_RUN_PREFIX)
            .and_then(|rest| rest.parse::<u32>().ok())
        {
            highest = highest.max(index);
        }
    }
    Ok(highest)
}

/// History lines are `<rfc3339>,<batch>,<index>`; unparsable lines are skipped.
fn highest_launched_run(history: &Path, batch: &str) -> io::Result<u32> {
    let contents = match std::fs::read_to_string(history) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    Ok(contents
        .lines()
        .filter_map(|line| line.split_once(',').map(|(_, rest)| rest))
        .filter_map(|rest| rest.rsplit_once(','))
        .filter(|(name, _)| *name == batch)
        .filter_map(|(_, index)| index.trim().parse::<u32>().ok())
        .max()
        .unwrap_or(0))
}
