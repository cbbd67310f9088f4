// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::app::types::{DriverSettings, SharedInput, WorkspaceSettings};

const CONFIG_FILE_NAME: &str = "sweepd.toml";
const CONFIG_ENV_VAR: &str = "SWEEPD_CONFIG_PATH";
const OWNER_ENV_VAR: &str = "USER";
const DEFAULT_MAX_PARALLEL_JOBS: usize = 200;
const DEFAULT_ADMISSION_POLL_SECS: u64 = 5;
const DEFAULT_SWEEP_EVERY: usize = 10;
const DEFAULT_ASSUMPTION_WINDOW_SECS: u64 = 10;
const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 5;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
const DEFAULT_EXECUTABLE: &str = "bond_switch_simulator.exe";
const DEFAULT_SUBMISSION_SCRIPT: &str = "job_submission_script.sh";
const DEFAULT_QUEUE_LOG_NAME: &str = "qsub.log";
const DEFAULT_SCRATCH_FILES: &[&str] = &["lammps.log"];
const DEFAULT_SHARED_INPUTS: &[(&str, &str)] = &[
    ("initial_network", "bss_network"),
    ("initial_lammps_files", "lammps_files"),
];

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bundle_dir: Option<String>,
    max_parallel_jobs: Option<usize>,
    admission_poll_secs: Option<u64>,
    sweep_every: Option<usize>,
    assumption_window_secs: Option<u64>,
    drain_interval_secs: Option<u64>,
    drain_timeout_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    executable: Option<String>,
    job_template: Option<String>,
    submission_script: Option<String>,
    queue_log_name: Option<String>,
    scratch_files: Option<Vec<String>>,
    shared_inputs: Option<Vec<FileSharedInput>>,
    archive_exclude: Option<Vec<String>>,
    queue_owner: Option<String>,
    verbose: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSharedInput {
    source: String,
    target: String,
}

#[derive(Debug)]
pub struct Config {
    pub bundle_dir: PathBuf,
    pub max_parallel_jobs: usize,
    pub admission_poll_secs: u64,
    pub sweep_every: usize,
    pub assumption_window_secs: u64,
    pub drain_interval_secs: u64,
    pub drain_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub executable: String,
    pub job_template: Option<PathBuf>,
    pub submission_script: String,
    pub queue_log_name: String,
    pub scratch_files: Vec<String>,
    pub shared_inputs: Vec<SharedInput>,
    pub archive_exclude: Vec<String>,
    pub queue_owner: String,
    pub verbose: bool,
}

impl Config {
    pub fn workspace_settings(&self) -> WorkspaceSettings {
        WorkspaceSettings {
            bundle_dir: self.bundle_dir.clone(),
            executable: self.executable.clone(),
            job_template: self.job_template.clone(),
            submission_script: self.submission_script.clone(),
            queue_log_name: self.queue_log_name.clone(),
            scratch_files: self.scratch_files.clone(),
            shared_inputs: self.shared_inputs.clone(),
        }
    }

    /// Upper bound on a single qstat, qsub or qdel call.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn driver_settings(&self, log_file: Option<PathBuf>) -> DriverSettings {
        DriverSettings {
            max_parallel_jobs: self.max_parallel_jobs,
            admission_poll: Duration::from_secs(self.admission_poll_secs),
            sweep_every: self.sweep_every,
            assumption_window: Duration::from_secs(self.assumption_window_secs),
            drain_interval: Duration::from_secs(self.drain_interval_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            queue_owner: self.queue_owner.clone(),
            archive_exclude: self.archive_exclude.clone(),
            log_file,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub bundle_dir: ConfigValue<PathBuf>,
    pub max_parallel_jobs: ConfigValue<usize>,
    pub drain_timeout_secs: ConfigValue<u64>,
    pub queue_owner: ConfigValue<String>,
    pub verbose: ConfigValue<bool>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub max_parallel_jobs: Option<usize>,
    pub drain_timeout_secs: Option<u64>,
    pub queue_owner: Option<String>,
    pub verbose: Option<bool>,
}

fn layered<T>(over: Option<T>, file: Option<T>, default: impl FnOnce() -> T) -> (T, ConfigSource) {
    match over {
        Some(value) => (value, ConfigSource::Override),
        None => match file {
            Some(value) => (value, ConfigSource::ConfigFile),
            None => (default(), ConfigSource::Default),
        },
    }
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());

    let (bundle_dir, bundle_dir_source) = match file_config.bundle_dir {
        Some(raw) => (resolve_path(&raw, base_dir), ConfigSource::ConfigFile),
        None => (
            binary_dir().with_context(|| {
                "failed to resolve the driver bundle directory; set bundle_dir in the config file"
            })?,
            ConfigSource::Default,
        ),
    };

    let (max_parallel_jobs, max_parallel_jobs_source) = layered(
        overrides.max_parallel_jobs,
        file_config.max_parallel_jobs,
        || DEFAULT_MAX_PARALLEL_JOBS,
    );
    if max_parallel_jobs == 0 {
        anyhow::bail!("max_parallel_jobs must be at least 1");
    }
    let (drain_timeout_secs, drain_timeout_source) = layered(
        overrides.drain_timeout_secs,
        file_config.drain_timeout_secs,
        || DEFAULT_DRAIN_TIMEOUT_SECS,
    );
    let (verbose, verbose_source) = layered(overrides.verbose, file_config.verbose, || false);

    let (queue_owner, queue_owner_source) = match overrides.queue_owner {
        Some(owner) => (owner, ConfigSource::Override),
        None => match file_config.queue_owner {
            Some(owner) => (owner, ConfigSource::ConfigFile),
            None => (
                std::env::var(OWNER_ENV_VAR).with_context(|| {
                    format!("{OWNER_ENV_VAR} is not set; specify --queue-owner or set queue_owner in the config file")
                })?,
                ConfigSource::Env,
            ),
        },
    };
    if queue_owner.trim().is_empty() {
        anyhow::bail!("queue_owner must not be empty");
    }

    let admission_poll_secs = file_config
        .admission_poll_secs
        .unwrap_or(DEFAULT_ADMISSION_POLL_SECS);
    let drain_interval_secs = file_config
        .drain_interval_secs
        .unwrap_or(DEFAULT_DRAIN_INTERVAL_SECS);
    if admission_poll_secs == 0 || drain_interval_secs == 0 {
        anyhow::bail!("admission_poll_secs and drain_interval_secs must be positive");
    }
    let command_timeout_secs = file_config
        .command_timeout_secs
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
    if command_timeout_secs == 0 {
        anyhow::bail!("command_timeout_secs must be positive");
    }
    let sweep_every = file_config.sweep_every.unwrap_or(DEFAULT_SWEEP_EVERY);
    if sweep_every == 0 {
        anyhow::bail!("sweep_every must be at least 1");
    }
    let executable = file_config
        .executable
        .unwrap_or_else(|| DEFAULT_EXECUTABLE.to_string());
    if executable.is_empty() || executable.contains('/') {
        anyhow::bail!("executable must be a plain file name, got {executable:?}");
    }

    let config = Config {
        bundle_dir,
        max_parallel_jobs,
        admission_poll_secs,
        sweep_every,
        assumption_window_secs: file_config
            .assumption_window_secs
            .unwrap_or(DEFAULT_ASSUMPTION_WINDOW_SECS),
        drain_interval_secs,
        drain_timeout_secs,
        command_timeout_secs,
        executable,
        job_template: file_config
            .job_template
            .map(|raw| resolve_path(&raw, base_dir)),
        submission_script: file_config
            .submission_script
            .unwrap_or_else(|| DEFAULT_SUBMISSION_SCRIPT.to_string()),
        queue_log_name: file_config
            .queue_log_name
            .unwrap_or_else(|| DEFAULT_QUEUE_LOG_NAME.to_string()),
        scratch_files: file_config.scratch_files.unwrap_or_else(|| {
            DEFAULT_SCRATCH_FILES
                .iter()
                .map(|name| name.to_string())
                .collect()
        }),
        shared_inputs: match file_config.shared_inputs {
            Some(inputs) => inputs
                .into_iter()
                .map(|input| SharedInput {
                    source: input.source,
                    target: input.target,
                })
                .collect(),
            None => DEFAULT_SHARED_INPUTS
                .iter()
                .map(|(source, target)| SharedInput {
                    source: source.to_string(),
                    target: target.to_string(),
                })
                .collect(),
        },
        archive_exclude: file_config.archive_exclude.unwrap_or_default(),
        queue_owner,
        verbose,
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        bundle_dir: ConfigValue {
            value: config.bundle_dir.clone(),
            source: bundle_dir_source,
        },
        max_parallel_jobs: ConfigValue {
            value: config.max_parallel_jobs,
            source: max_parallel_jobs_source,
        },
        drain_timeout_secs: ConfigValue {
            value: config.drain_timeout_secs,
            source: drain_timeout_source,
        },
        queue_owner: ConfigValue {
            value: config.queue_owner.clone(),
            source: queue_owner_source,
        },
        verbose: ConfigValue {
            value: config.verbose,
            source: verbose_source,
        },
    };

    Ok(LoadResult { config, report })
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

/// The driver is deployed as a bundle: binary, config and executable side by side.
fn binary_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to resolve the driver binary path")?;
    exe.parent()
        .map(Path::to_path_buf)
        .context("driver binary has no parent directory")
}

fn default_config_path() -> Result<PathBuf> {
    Ok(binary_dir()?.join(CONFIG_FILE_NAME))
}
