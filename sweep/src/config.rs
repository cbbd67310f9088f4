// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::app::types::{CompletionSettings, OrchestratorSettings};

const CONFIG_DIR_NAME: &str = "sweep";
const CONFIG_FILE_NAME: &str = "sweep.toml";
const CONFIG_ENV_VAR: &str = "SWEEP_CONFIG_PATH";
const DEFAULT_PORT: u16 = 22;
const DEFAULT_PASSWORD_ENV: &str = "SWEEP_SSH_PASSWORD";
const DEFAULT_REMOTE_ROOT: &str = "sweep";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 150 * 24 * 60 * 60;
const DEFAULT_KEEPALIVE_SECS: u64 = 60;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    identity_path: Option<String>,
    known_hosts_path: Option<String>,
    password_env: Option<String>,
    remote_root: Option<String>,
    driver_bundle: Option<String>,
    poll_interval_secs: Option<u64>,
    completion_timeout_secs: Option<u64>,
    keepalive_secs: Option<u64>,
    verbose: Option<bool>,
    log_file: Option<String>,
}

#[derive(Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub identity_path: Option<PathBuf>,
    pub known_hosts_path: Option<PathBuf>,
    pub password_env: String,
    pub remote_root: String,
    pub driver_bundle: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub completion_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Password for password and keyboard-interactive auth, if exported.
    pub fn password(&self) -> Option<String> {
        std::env::var(&self.password_env)
            .ok()
            .filter(|value| !value.is_empty())
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            remote_root: self.remote_root.clone(),
            driver_bundle: self.driver_bundle.clone(),
        }
    }

    pub fn completion_settings(&self) -> CompletionSettings {
        CompletionSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            timeout: Duration::from_secs(self.completion_timeout_secs),
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
    pub host: ConfigValue<String>,
    pub port: ConfigValue<u16>,
    pub username: ConfigValue<String>,
    pub identity_path: ConfigValue<Option<PathBuf>>,
    pub remote_root: ConfigValue<String>,
    pub verbose: ConfigValue<bool>,
    pub log_file: ConfigValue<Option<PathBuf>>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub identity_path: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
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

fn layered_path(
    over: Option<PathBuf>,
    file: Option<&str>,
    base_dir: Option<&Path>,
) -> (Option<PathBuf>, ConfigSource) {
    match over {
        Some(path) => (Some(expand_path(path)), ConfigSource::Override),
        None => match file {
            Some(raw) => (Some(resolve_path(raw, base_dir)), ConfigSource::ConfigFile),
            None => (None, ConfigSource::Default),
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

    let (host, host_source) = layered(overrides.host.map(Some), file_config.host.map(Some), || None);
    let host = host
        .filter(|host| !host.trim().is_empty())
        .context("no cluster host configured; pass --host or set host in the config file")?;
    let (port, port_source) = layered(overrides.port, file_config.port, || DEFAULT_PORT);
    let (username, username_source) = match overrides.username {
        Some(user) => (user, ConfigSource::Override),
        None => match file_config.username {
            Some(user) => (user, ConfigSource::ConfigFile),
            None => (
                std::env::var("USER").with_context(|| {
                    "no SSH user configured; pass --user or set username in the config file"
                })?,
                ConfigSource::Env,
            ),
        },
    };
    if username.trim().is_empty() {
        anyhow::bail!("username must not be empty");
    }
    let (identity_path, identity_source) = layered_path(
        overrides.identity_path,
        file_config.identity_path.as_deref(),
        base_dir,
    );
    let (log_file, log_file_source) = layered_path(
        overrides.log_file,
        file_config.log_file.as_deref(),
        base_dir,
    );
    let (verbose, verbose_source) = layered(overrides.verbose, file_config.verbose, || false);

    let (remote_root, remote_root_source) = match file_config.remote_root {
        Some(root) => (root, ConfigSource::ConfigFile),
        None => (DEFAULT_REMOTE_ROOT.to_string(), ConfigSource::Default),
    };
    if remote_root.trim().is_empty() {
        anyhow::bail!("remote_root must not be empty");
    }

    let poll_interval_secs = file_config
        .poll_interval_secs
        .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
    if poll_interval_secs == 0 {
        anyhow::bail!("poll_interval_secs must be positive");
    }

    let config = Config {
        host,
        port,
        username,
        identity_path,
        known_hosts_path: file_config
            .known_hosts_path
            .map(|raw| resolve_path(&raw, base_dir)),
        password_env: file_config
            .password_env
            .unwrap_or_else(|| DEFAULT_PASSWORD_ENV.to_string()),
        remote_root,
        driver_bundle: file_config
            .driver_bundle
            .map(|raw| resolve_path(&raw, base_dir)),
        poll_interval_secs,
        completion_timeout_secs: file_config
            .completion_timeout_secs
            .unwrap_or(DEFAULT_COMPLETION_TIMEOUT_SECS),
        keepalive_secs: file_config.keepalive_secs.unwrap_or(DEFAULT_KEEPALIVE_SECS),
        verbose,
        log_file,
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        host: ConfigValue {
            value: config.host.clone(),
            source: host_source,
        },
        port: ConfigValue {
            value: config.port,
            source: port_source,
        },
        username: ConfigValue {
            value: config.username.clone(),
            source: username_source,
        },
        identity_path: ConfigValue {
            value: config.identity_path.clone(),
            source: identity_source,
        },
        remote_root: ConfigValue {
            value: config.remote_root.clone(),
            source: remote_root_source,
        },
        verbose: ConfigValue {
            value: config.verbose,
            source: verbose_source,
        },
        log_file: ConfigValue {
            value: config.log_file.clone(),
            source: log_file_source,
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

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve the user config directory")?;
    Ok(base.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
        Ok(load_with_report(config_path_override, overrides)?.config)
    }

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: &'static str,
        prev: Option<OsString>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn clear(key: &'static str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => {
                    // SAFETY: tests serialize env mutations with ENV_LOCK.
                    unsafe {
                        std::env::set_var(self.key, value);
                    }
                }
                None => {
                    // SAFETY: tests serialize env mutations with ENV_LOCK.
                    unsafe {
                        std::env::remove_var(self.key);
                    }
                }
            }
        }
    }

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let config_dir = dir.path().join("sweep");
        fs::create_dir_all(&config_dir).unwrap();
        let path = config_dir.join(CONFIG_FILE_NAME);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults_fill_everything_not_in_the_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "host = \"cluster.example.org\"\nusername = \"alice\"\n",
        );

        let LoadResult { config, report } =
            load_with_report(Some(path), Overrides::default()).unwrap();

        assert_eq!(config.port, 22);
        assert_eq!(config.remote_root, "sweep");
        assert_eq!(config.password_env, "SWEEP_SSH_PASSWORD");
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.completion_timeout_secs, 150 * 24 * 60 * 60);
        assert_eq!(config.keepalive_secs, 60);
        assert!(config.identity_path.is_none());
        assert!(config.driver_bundle.is_none());
        assert!(!config.verbose);
        assert_eq!(report.host.source, ConfigSource::ConfigFile);
        assert_eq!(report.port.source, ConfigSource::Default);
        assert_eq!(report.remote_root.source, ConfigSource::Default);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
host = "cluster.example.org"
username = "alice"
identity_path = "keys/id_ed25519"
known_hosts_path = "/etc/ssh/ssh_known_hosts"
driver_bundle = "bundle"
remote_root = "/scratch/alice/sweep"
poll_interval_secs = 30
"#,
        );

        let config = load(Some(path), Overrides::default()).unwrap();
        let base = dir.path().join("sweep");

        assert_eq!(config.identity_path, Some(base.join("keys/id_ed25519")));
        assert_eq!(
            config.known_hosts_path,
            Some(PathBuf::from("/etc/ssh/ssh_known_hosts"))
        );
        assert_eq!(config.driver_bundle, Some(base.join("bundle")));
        let settings = config.orchestrator_settings();
        assert_eq!(settings.remote_root, "/scratch/alice/sweep");
        assert_eq!(
            config.completion_settings().poll_interval,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn cli_overrides_take_precedence_over_file_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "host = \"a.example.org\"\nport = 2200\nusername = \"alice\"\nverbose = false\n",
        );

        let LoadResult { config, report } = load_with_report(
            Some(path),
            Overrides {
                host: Some("b.example.org".to_string()),
                port: Some(22022),
                username: Some("bob".to_string()),
                identity_path: Some(PathBuf::from("/keys/id")),
                log_file: Some(PathBuf::from("/tmp/sweep.log")),
                verbose: Some(true),
            },
        )
        .unwrap();

        assert_eq!(config.host, "b.example.org");
        assert_eq!(config.port, 22022);
        assert_eq!(config.username, "bob");
        assert_eq!(config.identity_path, Some(PathBuf::from("/keys/id")));
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/sweep.log")));
        assert!(config.verbose);
        assert_eq!(report.host.source, ConfigSource::Override);
        assert_eq!(report.port.source, ConfigSource::Override);
        assert_eq!(report.identity_path.source, ConfigSource::Override);
    }

    #[test]
    fn missing_host_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "username = \"alice\"\n");
        let err = load(Some(path), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("no cluster host"));
    }

    #[test]
    fn unknown_keys_are_errors() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "hots = \"cluster\"\n");
        let err = load(Some(path), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }

    #[test]
    fn password_comes_from_the_named_variable() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _pw = EnvVarGuard::set("SWEEP_TEST_PASSWORD", "s3cret");
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "host = \"h\"\nusername = \"u\"\npassword_env = \"SWEEP_TEST_PASSWORD\"\n",
        );
        let config = load(Some(path), Overrides::default()).unwrap();
        assert_eq!(config.password().as_deref(), Some("s3cret"));

        let _empty = EnvVarGuard::set("SWEEP_TEST_PASSWORD", "");
        assert_eq!(config.password(), None);
    }

    #[test]
    fn env_config_path_used_when_no_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "host = \"h\"\nusername = \"u\"\nport = 2222\n");
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, path.to_str().unwrap());

        let LoadResult { config, report } = load_with_report(None, Overrides::default()).unwrap();
        assert_eq!(config.port, 2222);
        assert_eq!(report.config_path, Some(path));
        assert_eq!(report.config_path_source, Some(ConfigSource::Env));
    }

    #[test]
    fn env_config_path_must_exist() {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, missing.to_str().unwrap());
        let err = load(None, Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }
}
