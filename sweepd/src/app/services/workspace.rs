// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! The run directory on the head node and the per-job files inside it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sweepcore::archive::{self, ArchiveError, ArchiveWriter, ExcludeSet};
use sweepcore::errors::{AppError, AppErrorKind, AppResult, codes};
use sweepcore::layout::JOBS_DIR;
use sweepcore::model::{ARCHIVE_EXTENSION, CompletionSignal, Job, ResultArchive};
use walkdir::WalkDir;

use crate::app::services::job_script::JobScript;
use crate::app::types::WorkspaceSettings;

pub const DRIVER_LOG_NAME: &str = "sweepd.log";
pub const INPUT_FILES_DIR: &str = "input_files";
pub const OUTPUT_FILES_DIR: &str = "output_files";

pub struct JobWorkspace {
    run_dir: PathBuf,
    batch_name: String,
    settings: WorkspaceSettings,
    script: JobScript,
}

impl JobWorkspace {
    pub fn new(run_dir: PathBuf, batch_name: String, settings: WorkspaceSettings) -> AppResult<Self> {
        let script = match &settings.job_template {
            Some(path) => JobScript::from_file(path, settings.executable.clone())?,
            None => JobScript::builtin(settings.executable.clone())?,
        };
        Ok(Self {
            run_dir,
            batch_name,
            settings,
            script,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn batch_name(&self) -> &str {
        &self.batch_name
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.run_dir.join(JOBS_DIR)
    }

    /// The archive and the completion flag are written next to the run
    /// directory, so its parent has to accept new files.
    pub fn check_parent_writable(&self) -> AppResult<()> {
        let parent = self.run_dir.parent().ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                format!("run directory {} has no parent", self.run_dir.display()),
            )
        })?;
        let probe = parent.join(format!(".{}.probe", self.run_name()));
        fs::write(&probe, b"").map_err(|err| {
            AppError::with_message(
                AppErrorKind::PermissionDenied,
                codes::PERMISSION_DENIED,
                format!("cannot write to {}: {err}", parent.display()),
            )
        })?;
        let _ = fs::remove_file(&probe);
        Ok(())
    }

    fn run_name(&self) -> String {
        self.run_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// The uploaded batch archive: the only `*.zip` directly in the run directory.
    pub fn find_batch_archive(&self) -> AppResult<PathBuf> {
        let entries = fs::read_dir(&self.run_dir)
            .map_err(|err| AppError::local_io("failed to list", &self.run_dir, err))?;
        let mut archives = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| AppError::local_io("failed to list", &self.run_dir, err))?;
            let path = entry.path();
            let is_zip = path
                .extension()
                .map(|ext| ext == ARCHIVE_EXTENSION)
                .unwrap_or(false);
            if is_zip && path.is_file() {
                archives.push(path);
            }
        }
        archives.sort();
        match archives.len() {
            0 => Err(AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("no batch archive found in {}", self.run_dir.display()),
            )),
            1 => Ok(archives.remove(0)),
            _ => {
                tracing::warn!(
                    candidates = archives.len(),
                    "more than one archive in run directory, using the first"
                );
                Ok(archives.remove(0))
            }
        }
    }

    /// Extracts the batch archive in place and deletes it.
    pub async fn unpack_batch(&self) -> AppResult<usize> {
        let archive_path = self.find_batch_archive()?;
        tracing::info!(archive = %archive_path.display(), "unpacking batch archive");
        let dest = self.run_dir.clone();
        let source = archive_path.clone();
        let entries = tokio::task::spawn_blocking(move || archive::extract(&source, &dest))
            .await
            .map_err(join_error)?
            .map_err(|err| archive_error("failed to unpack batch archive", err))?;
        fs::remove_file(&archive_path)
            .map_err(|err| AppError::local_io("failed to remove", &archive_path, err))?;
        Ok(entries)
    }

    /// Job directories under `jobs/`, in name order.
    pub fn discover_jobs(&self) -> AppResult<Vec<Job>> {
        let jobs_dir = self.jobs_dir();
        let entries = fs::read_dir(&jobs_dir)
            .map_err(|err| AppError::local_io("failed to list", &jobs_dir, err))?;
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| AppError::local_io("failed to list", &jobs_dir, err))?;
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        let jobs: Vec<Job> = dirs
            .into_iter()
            .filter_map(|dir| Job::new(&self.batch_name, dir))
            .collect();
        if jobs.is_empty() {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::EMPTY_BATCH,
                format!("no jobs found in {}", jobs_dir.display()),
            ));
        }
        Ok(jobs)
    }

    /// Copies shared inputs and the executable into the job directory and
    /// writes its submission script. Returns the script path.
    pub fn materialize(&self, job: &Job) -> AppResult<PathBuf> {
        let input_dir = job.directory().join(INPUT_FILES_DIR);
        fs::create_dir_all(&input_dir)
            .map_err(|err| AppError::local_io("failed to create", &input_dir, err))?;
        for shared in &self.settings.shared_inputs {
            let source = self.run_dir.join(&shared.source);
            if !source.is_dir() {
                tracing::debug!(source = %source.display(), "shared input not present, skipping");
                continue;
            }
            copy_tree(&source, &input_dir.join(&shared.target))?;
        }

        let executable_source = self.settings.bundle_dir.join(&self.settings.executable);
        let executable = job.directory().join(&self.settings.executable);
        fs::copy(&executable_source, &executable)
            .map_err(|err| AppError::local_io("failed to copy executable", &executable_source, err))?;
        make_executable(&executable)?;

        let script_path = job.directory().join(&self.settings.submission_script);
        let rendered = self.script.render(job)?;
        fs::write(&script_path, rendered)
            .map_err(|err| AppError::local_io("failed to write", &script_path, err))?;
        make_executable(&script_path)?;
        Ok(script_path)
    }

    /// Moves the engine's `<queue name>.o<id>` file to `output_files/`.
    /// Returns `false` when no such file exists (yet).
    pub fn harvest_queue_log(&self, job: &Job) -> AppResult<bool> {
        let prefix = format!("{}.o", job.queue_name());
        let entries = match fs::read_dir(job.directory()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(AppError::local_io("failed to list", job.directory(), err)),
        };
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        candidates.sort();
        let Some(source) = candidates.into_iter().next() else {
            return Ok(false);
        };
        let output_dir = job.directory().join(OUTPUT_FILES_DIR);
        fs::create_dir_all(&output_dir)
            .map_err(|err| AppError::local_io("failed to create", &output_dir, err))?;
        let dest = output_dir.join(&self.settings.queue_log_name);
        fs::rename(&source, &dest)
            .map_err(|err| AppError::local_io("failed to move queue log", &source, err))?;
        Ok(true)
    }

    /// Deletes the large per-job artifacts. Absent files are not an error.
    pub fn reclaim(&self, job: &Job) -> AppResult<usize> {
        let dir = job.directory();
        let mut removed = 0;
        removed += remove_if_present(&dir.join(&self.settings.executable))?;
        removed += remove_if_present(&dir.join(&self.settings.submission_script))?;
        for name in &self.settings.scratch_files {
            removed += remove_if_present(&dir.join(OUTPUT_FILES_DIR).join(name))?;
        }
        for shared in &self.settings.shared_inputs {
            removed += remove_if_present(&dir.join(INPUT_FILES_DIR).join(&shared.target))?;
        }
        Ok(removed)
    }

    /// Sweeps every job directory for leftovers of [`Self::reclaim`].
    pub fn emergency_clean(&self) -> AppResult<usize> {
        let jobs_dir = self.jobs_dir();
        if !jobs_dir.is_dir() {
            return Ok(0);
        }
        let mut stray = Vec::new();
        let walker = WalkDir::new(&jobs_dir)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| !self.is_shared_copy(&jobs_dir, entry.path()));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("emergency clean could not read an entry: {err}");
                    continue;
                }
            };
            if entry.file_type().is_file() && self.is_scratch_name(&entry.file_name().to_string_lossy()) {
                stray.push(entry.into_path());
            }
        }
        for job_dir in fs::read_dir(&jobs_dir)
            .map_err(|err| AppError::local_io("failed to list", &jobs_dir, err))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
        {
            for shared in &self.settings.shared_inputs {
                let copy = job_dir.join(INPUT_FILES_DIR).join(&shared.target);
                if copy.exists() {
                    stray.push(copy);
                }
            }
        }
        let mut removed = 0;
        for path in stray {
            removed += remove_if_present(&path)?;
        }
        Ok(removed)
    }

    fn is_scratch_name(&self, name: &str) -> bool {
        name == self.settings.executable
            || name == self.settings.submission_script
            || self.settings.scratch_files.iter().any(|scratch| scratch == name)
    }

    /// `jobs/<job>/input_files/<shared target>`
    fn is_shared_copy(&self, jobs_dir: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(jobs_dir) else {
            return false;
        };
        let parts: Vec<_> = relative.components().collect();
        parts.len() == 3
            && parts[1].as_os_str() == INPUT_FILES_DIR
            && self
                .settings
                .shared_inputs
                .iter()
                .any(|shared| parts[2].as_os_str() == shared.target.as_str())
    }

    /// Packs the run directory into the result archive next to it, appending
    /// `log_file` (if any) as the final entry.
    pub async fn archive(&self, excludes: &ExcludeSet, log_file: Option<&Path>) -> AppResult<PathBuf> {
        archive_run(&self.run_dir, excludes, log_file).await
    }

    pub fn remove_run_dir(&self) -> AppResult<()> {
        remove_run(&self.run_dir)
    }

    /// Creates the empty completion flag. Its existence is the whole message.
    pub fn signal_completion(&self) -> AppResult<PathBuf> {
        write_completion_flag(&self.run_dir)
    }
}

/// Archive excludes for a run: the configured patterns plus the driver log
/// when it lives inside the run directory, since it is appended last.
pub fn run_excludes(run_dir: &Path, patterns: &[String], log_file: Option<&Path>) -> AppResult<ExcludeSet> {
    let mut patterns = patterns.to_vec();
    if let Some(relative) = log_file
        .and_then(|path| path.strip_prefix(run_dir).ok())
        .map(|path| path.to_string_lossy().replace('\\', "/"))
    {
        patterns.push(relative);
    }
    ExcludeSet::new(&patterns).map_err(|err| {
        AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            err.to_string(),
        )
    })
}

async fn archive_run(run_dir: &Path, excludes: &ExcludeSet, log_file: Option<&Path>) -> AppResult<PathBuf> {
    let archive_path = ResultArchive::beside(run_dir).path().to_path_buf();
    if archive_path.exists() {
        tracing::warn!(archive = %archive_path.display(), "replacing existing result archive");
    }
    let run_dir = run_dir.to_path_buf();
    let excludes = excludes.clone();
    let log_file = log_file.filter(|path| path.is_file()).map(Path::to_path_buf);
    let dest = archive_path.clone();
    let entries = tokio::task::spawn_blocking(move || -> Result<usize, ArchiveError> {
        let mut writer = ArchiveWriter::create(&dest)?;
        if run_dir.is_dir() {
            writer.add_tree(&run_dir, &excludes)?;
        }
        if let Some(log_file) = log_file {
            let name = log_file
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| DRIVER_LOG_NAME.to_string());
            writer.add_file(&log_file, &name)?;
        }
        writer.finish()
    })
    .await
    .map_err(join_error)?
    .map_err(|err| archive_error("failed to write result archive", err))?;
    tracing::info!(archive = %archive_path.display(), entries, "result archive written");
    Ok(archive_path)
}

fn remove_run(run_dir: &Path) -> AppResult<()> {
    match fs::remove_dir_all(run_dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::local_io("failed to remove", run_dir, err)),
    }
}

fn write_completion_flag(run_dir: &Path) -> AppResult<PathBuf> {
    let signal = CompletionSignal::beside(run_dir);
    fs::write(signal.path(), b"")
        .map_err(|err| AppError::local_io("failed to write", signal.path(), err))?;
    Ok(signal.path().to_path_buf())
}

/// Teardown for a run whose driver never got going, for instance because
/// its configuration was rejected: whatever the run directory holds is
/// archived with the log, then the completion flag is written.
pub async fn abandon_run(run_dir: &Path, log_file: Option<&Path>) -> AppResult<PathBuf> {
    let excludes = run_excludes(run_dir, &[], log_file)?;
    let mut outcome = archive_run(run_dir, &excludes, log_file).await.map(|_| ());
    if outcome.is_ok() {
        outcome = remove_run(run_dir);
    }
    let flag = write_completion_flag(run_dir)?;
    outcome.map(|()| flag)
}

fn copy_tree(source: &Path, dest: &Path) -> AppResult<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|err| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::LOCAL_ERROR,
                format!("failed to walk {}: {err}", source.display()),
            )
        })?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| AppError::local_io("failed to create", &target, err))?;
        } else {
            fs::copy(entry.path(), &target)
                .map_err(|err| AppError::local_io("failed to copy", entry.path(), err))?;
        }
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> AppResult<usize> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(AppError::local_io("failed to inspect", path, err)),
    };
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(1),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(AppError::local_io("failed to remove", path, err)),
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> AppResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|err| AppError::local_io("failed to chmod", path, err))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> AppResult<()> {
    Ok(())
}

fn archive_error(action: &str, err: ArchiveError) -> AppError {
    AppError::with_message(
        AppErrorKind::Internal,
        codes::ARCHIVE_ERROR,
        format!("{action}: {err}"),
    )
}

fn join_error(err: tokio::task::JoinError) -> AppError {
    AppError::with_message(
        AppErrorKind::Internal,
        codes::INTERNAL_ERROR,
        format!("archive task failed: {err}"),
    )
}
