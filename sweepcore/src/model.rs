// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Data types shared by the controller and the cluster-side driver.

use std::fmt;
use std::path::{Path, PathBuf};

use time::{OffsetDateTime, PrimitiveDateTime};

use crate::archive;
use crate::errors::{AppError, AppErrorKind, AppResult, codes};

pub const COMPLETION_FLAG_SUFFIX: &str = "_completion_flag";
pub const ARCHIVE_EXTENSION: &str = "zip";

/// A named collection of independent jobs packed into one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    name: String,
    archive_path: PathBuf,
    job_count: usize,
}

impl Batch {
    /// Reads the archive index and counts the `jobs/<name>/` entries.
    /// The batch name falls back to the archive file stem.
    pub fn open(archive_path: &Path, name: Option<&str>) -> AppResult<Self> {
        if !archive_path.is_file() {
            return Err(AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("batch archive not found: {}", archive_path.display()),
            ));
        }
        let name = match name {
            Some(name) => name.trim().to_string(),
            None => archive_path
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_default(),
        };
        validate_batch_name(&name)?;
        let jobs = archive::job_names(archive_path).map_err(|err| {
            AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::ARCHIVE_ERROR,
                format!("failed to read batch archive: {err}"),
            )
            .with_context(archive_path.display().to_string())
        })?;
        if jobs.is_empty() {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::EMPTY_BATCH,
                format!(
                    "batch archive {} contains no jobs/<job>/ directories",
                    archive_path.display()
                ),
            ));
        }
        Ok(Self {
            name,
            archive_path: archive_path.to_path_buf(),
            job_count: jobs.len(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn job_count(&self) -> usize {
        self.job_count
    }
}

/// Batch names become directory names on both ends and the prefix of queue job names.
pub fn validate_batch_name(name: &str) -> AppResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control());
    if invalid {
        return Err(AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            format!("invalid batch name '{name}'"),
        ));
    }
    Ok(())
}

/// One unit of work: a directory under `jobs/` inside a run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    id: String,
    queue_name: String,
    directory: PathBuf,
}

impl Job {
    /// Returns `None` when `directory` has no final component.
    pub fn new(batch_name: &str, directory: PathBuf) -> Option<Self> {
        let dir_name = directory.file_name()?.to_string_lossy().to_string();
        let id = format!("{batch_name}_{dir_name}");
        let queue_name = queue_safe_name(&id);
        Some(Self {
            id,
            queue_name,
            directory,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name the job is submitted under and later looked up by in the queue listing.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn dir_name(&self) -> String {
        self.directory
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

fn queue_safe_name(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '/' | ':' | '@' | '\\' | '*' | '?' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// A job that the queue accepted, with the time the driver recorded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job: Job,
    pub submitted_at: OffsetDateTime,
    pub queue_id: Option<u64>,
}

impl SubmittedJob {
    pub fn queue_name(&self) -> &str {
        self.job.queue_name()
    }

    pub fn age(&self, now: OffsetDateTime) -> time::Duration {
        now - self.submitted_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Queued,
    Running,
    Suspended,
    Deleting,
    Error,
    Other,
}

impl QueueState {
    /// Classifies a grid engine state code such as `r`, `qw`, `hqw`, `Eqw` or `dr`.
    pub fn from_code(code: &str) -> Self {
        if code.contains('E') {
            QueueState::Error
        } else if code.contains('d') {
            QueueState::Deleting
        } else if code.contains(['s', 'S', 'T']) {
            QueueState::Suspended
        } else if code.contains(['r', 't', 'R']) {
            QueueState::Running
        } else if code.contains(['q', 'w', 'h']) {
            QueueState::Queued
        } else {
            QueueState::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueState::Queued => "queued",
            QueueState::Running => "running",
            QueueState::Suspended => "suspended",
            QueueState::Deleting => "deleting",
            QueueState::Error => "error",
            QueueState::Other => "other",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the queue listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub queue_id: u64,
    pub name: String,
    pub owner: String,
    pub state: QueueState,
    pub state_code: String,
    pub since: Option<PrimitiveDateTime>,
}

impl QueueEntry {
    pub fn is_error(&self) -> bool {
        self.state == QueueState::Error
    }
}

/// Marker file whose existence means the driver finished and the archive is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSignal {
    path: PathBuf,
}

impl CompletionSignal {
    /// `<parent>/<run name>_completion_flag`, next to the run directory.
    pub fn beside(run_dir: &Path) -> Self {
        Self {
            path: sibling_with_suffix(run_dir, COMPLETION_FLAG_SUFFIX),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The single compressed file holding a run's results, next to the run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultArchive {
    path: PathBuf,
}

impl ResultArchive {
    pub fn beside(run_dir: &Path) -> Self {
        Self {
            path: sibling_with_suffix(run_dir, &format!(".{ARCHIVE_EXTENSION}")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sibling_with_suffix(run_dir: &Path, suffix: &str) -> PathBuf {
    let name = run_dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let file = format!("{name}{suffix}");
    match run_dir.parent() {
        Some(parent) => parent.join(file),
        None => PathBuf::from(file),
    }
}
