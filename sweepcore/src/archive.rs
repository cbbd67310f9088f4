// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Zip containers for batch uploads, result archives and the driver bundle.
//!
//! Everything here is blocking; async callers go through `spawn_blocking`.

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use thiserror::Error;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const JOBS_DIR: &str = "jobs";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("walking {0}")]
    Walk(#[from] walkdir::Error),
    #[error("invalid exclude pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

impl ArchiveError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        ArchiveError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Glob patterns matched against `/`-separated paths relative to the archived root.
/// A `*` never crosses a separator; use `**` for that.
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    patterns: Vec<String>,
    set: GlobSet,
}

impl ExcludeSet {
    pub fn new<I, S>(patterns: I) -> Result<Self, ArchiveError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|source| ArchiveError::Pattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
            builder.add(glob);
            kept.push(pattern.to_string());
        }
        let set = builder.build().map_err(|source| ArchiveError::Pattern {
            pattern: kept.join(", "),
            source,
        })?;
        Ok(Self {
            patterns: kept,
            set,
        })
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        self.set.is_match(relative)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Incrementally builds a deflated zip file on disk.
pub struct ArchiveWriter {
    path: PathBuf,
    zip: ZipWriter<File>,
    entries: usize,
}

impl ArchiveWriter {
    /// Creates (or truncates) the archive at `path`.
    pub fn create(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::create(path).map_err(|err| ArchiveError::io("creating", path, err))?;
        Ok(Self {
            path: path.to_path_buf(),
            zip: ZipWriter::new(file),
            entries: 0,
        })
    }

    /// Adds every entry under `root`, named relative to `root`. Excluded
    /// directories are skipped with their whole subtree.
    pub fn add_tree(&mut self, root: &Path, excludes: &ExcludeSet) -> Result<usize, ArchiveError> {
        let before = self.entries;
        let walker = WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| match relative_name(root, entry.path()) {
                Some(name) => !excludes.is_excluded(&name),
                None => false,
            });
        for entry in walker {
            let entry = entry?;
            let Some(name) = relative_name(root, entry.path()) else {
                continue;
            };
            if entry.file_type().is_dir() {
                self.zip
                    .add_directory(format!("{name}/"), directory_options(entry.path()))?;
                self.entries += 1;
            } else if entry.file_type().is_file() {
                self.add_file(entry.path(), &name)?;
            }
        }
        Ok(self.entries - before)
    }

    /// Adds a single file under the given entry name.
    pub fn add_file(&mut self, source: &Path, name: &str) -> Result<(), ArchiveError> {
        let mut file =
            File::open(source).map_err(|err| ArchiveError::io("opening", source, err))?;
        let metadata = file
            .metadata()
            .map_err(|err| ArchiveError::io("reading metadata of", source, err))?;
        let options = file_options(&metadata);
        self.zip.start_file(name.to_string(), options)?;
        io::copy(&mut file, &mut self.zip).map_err(|err| ArchiveError::io("archiving", source, err))?;
        self.entries += 1;
        Ok(())
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the central directory and flushes the file.
    pub fn finish(self) -> Result<usize, ArchiveError> {
        let file = self.zip.finish()?;
        file.sync_all()
            .map_err(|err| ArchiveError::io("syncing", &self.path, err))?;
        Ok(self.entries)
    }
}

/// Packs `root` into a fresh archive at `dest`.
pub fn pack_dir(root: &Path, dest: &Path, excludes: &ExcludeSet) -> Result<usize, ArchiveError> {
    let mut writer = ArchiveWriter::create(dest)?;
    writer.add_tree(root, excludes)?;
    writer.finish()
}

/// Extracts `archive` into `dest`, creating it when needed. Entries that would
/// escape `dest` are rejected by the zip reader.
pub fn extract(archive: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    let file = File::open(archive).map_err(|err| ArchiveError::io("opening", archive, err))?;
    let mut zip = ZipArchive::new(file)?;
    std::fs::create_dir_all(dest).map_err(|err| ArchiveError::io("creating", dest, err))?;
    zip.extract(dest)?;
    Ok(zip.len())
}

/// Distinct `<name>` values of `jobs/<name>/...` entries.
pub fn job_names(archive: &Path) -> Result<BTreeSet<String>, ArchiveError> {
    let file = File::open(archive).map_err(|err| ArchiveError::io("opening", archive, err))?;
    let zip = ZipArchive::new(file)?;
    Ok(job_names_from_entries(zip.file_names()))
}

fn job_names_from_entries<'a>(names: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    let mut jobs = BTreeSet::new();
    for name in names {
        let mut parts = name.split('/');
        if parts.next() != Some(JOBS_DIR) {
            continue;
        }
        let Some(job) = parts.next().filter(|job| !job.is_empty()) else {
            continue;
        };
        // `jobs/<file>` without a trailing separator is a stray file, not a job.
        if parts.next().is_some() {
            jobs.insert(job.to_string());
        }
    }
    jobs
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn file_options(metadata: &std::fs::Metadata) -> SimpleFileOptions {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(metadata.len() >= u64::from(u32::MAX));
    with_mode(options, metadata)
}

fn directory_options(path: &Path) -> SimpleFileOptions {
    let options = SimpleFileOptions::default();
    match std::fs::metadata(path) {
        Ok(metadata) => with_mode(options, &metadata),
        Err(_) => options,
    }
}

#[cfg(unix)]
fn with_mode(options: SimpleFileOptions, metadata: &std::fs::Metadata) -> SimpleFileOptions {
    use std::os::unix::fs::PermissionsExt;
    options.unix_permissions(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn with_mode(options: SimpleFileOptions, _metadata: &std::fs::Metadata) -> SimpleFileOptions {
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn entry_names(path: &Path) -> Vec<String> {
        let zip = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    #[test]
    fn job_names_ignore_stray_files_and_other_dirs() {
        let names = [
            "jobs/",
            "jobs/readme.txt",
            "jobs/a/",
            "jobs/b/input_files/p.txt",
            "initial_network/jobs/x/",
            "jobs//oops",
        ];
        let jobs = job_names_from_entries(names.into_iter());
        assert_eq!(
            jobs.into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn exclude_set_does_not_cross_separators_with_single_star() {
        let set = ExcludeSet::new(["jobs/*/input_files/bss_network", "**/lammps.log"]).unwrap();
        assert!(set.is_excluded("jobs/a/input_files/bss_network"));
        assert!(!set.is_excluded("jobs/a/b/input_files/bss_network"));
        assert!(set.is_excluded("jobs/a/output_files/lammps.log"));
        assert!(set.is_excluded("lammps.log"));
        assert!(!set.is_excluded("jobs/a/output_files/lammps.log.bak"));
    }

    #[test]
    fn invalid_exclude_pattern_is_reported() {
        let err = ExcludeSet::new(["jobs/[a"]).unwrap_err();
        assert!(err.to_string().contains("jobs/[a"));
    }

    #[test]
    fn add_tree_skips_excluded_subtrees_and_appends_files_last() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("run");
        fs::create_dir_all(root.join("jobs/a/output_files")).unwrap();
        fs::create_dir_all(root.join("jobs/a/input_files/bss_network")).unwrap();
        fs::write(root.join("jobs/a/output_files/result.csv"), "1,2\n").unwrap();
        fs::write(root.join("jobs/a/output_files/lammps.log"), "noise").unwrap();
        fs::write(root.join("jobs/a/input_files/bss_network/net.dat"), "big").unwrap();
        fs::write(root.join("driver.log"), "log").unwrap();

        let excludes = ExcludeSet::new([
            "**/lammps.log",
            "jobs/*/input_files/bss_network",
            "driver.log",
        ])
        .unwrap();
        let dest = dir.path().join("run.zip");
        let mut writer = ArchiveWriter::create(&dest).unwrap();
        writer.add_tree(&root, &excludes).unwrap();
        writer.add_file(&root.join("driver.log"), "driver.log").unwrap();
        writer.finish().unwrap();

        let zip = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let ordered: Vec<&str> = zip.file_names().collect();
        assert_eq!(ordered.last(), Some(&"driver.log"));
        assert_eq!(
            entry_names(&dest),
            vec![
                "driver.log",
                "jobs/",
                "jobs/a/",
                "jobs/a/input_files/",
                "jobs/a/output_files/",
                "jobs/a/output_files/result.csv",
            ]
        );
    }

    #[test]
    fn pack_and_extract_preserve_contents() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("bundle");
        fs::create_dir_all(root.join("templates")).unwrap();
        fs::write(root.join("sweepd.toml"), "max_parallel_jobs = 4\n").unwrap();
        fs::write(root.join("templates/job.sh"), "#!/bin/sh\n").unwrap();
        let dest = dir.path().join("bundle.zip");
        let count = pack_dir(&root, &dest, &ExcludeSet::empty()).unwrap();
        assert_eq!(count, 3);

        let out = dir.path().join("out");
        extract(&dest, &out).unwrap();
        assert_eq!(
            fs::read_to_string(out.join("sweepd.toml")).unwrap(),
            "max_parallel_jobs = 4\n"
        );
        assert_eq!(
            fs::read_to_string(out.join("templates/job.sh")).unwrap(),
            "#!/bin/sh\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn pack_keeps_executable_bits() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("bundle");
        fs::create_dir_all(&root).unwrap();
        let exe = root.join("sweepd");
        fs::write(&exe, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        let dest = dir.path().join("bundle.zip");
        pack_dir(&root, &dest, &ExcludeSet::empty()).unwrap();

        let out = dir.path().join("out");
        extract(&dest, &out).unwrap();
        let mode = fs::metadata(out.join("sweepd")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
