// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::anyhow;
use russh::client::Config;
use russh::keys::known_hosts::{learn_known_hosts, learn_known_hosts_path};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

mod auth;
mod exec;
mod sftp;

pub(crate) use sftp::{is_missing_path, is_permission_denied};

/// russh client handler; only the server key check is customized.
#[derive(Clone, Debug)]
struct ClientHandler {
    host: String,
    addr: SocketAddr,
    known_hosts_path: Option<PathBuf>,
}

impl ClientHandler {
    fn new(host: String, addr: SocketAddr, known_hosts_path: Option<PathBuf>) -> Self {
        Self {
            host,
            addr,
            known_hosts_path,
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;
    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        verify_server_key(
            &self.host,
            self.addr,
            server_public_key,
            self.known_hosts_path.as_deref(),
        )
    }
}

/// Parameters for establishing the SSH connection.
#[derive(Clone, PartialEq, Eq)]
pub struct SshParams {
    /// Original hostname or IP used for known_hosts lookup.
    pub host: String,
    pub addr: SocketAddr,
    pub username: String,
    pub identity_path: Option<PathBuf>,
    /// Answers password and keyboard-interactive challenges.
    pub password: Option<String>,
    /// `~/.ssh/known_hosts` when absent.
    pub known_hosts_path: Option<PathBuf>,
    pub keepalive_secs: u64,
}

impl std::fmt::Debug for SshParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshParams")
            .field("host", &self.host)
            .field("addr", &self.addr)
            .field("username", &self.username)
            .field("identity_path", &self.identity_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("known_hosts_path", &self.known_hosts_path)
            .field("keepalive_secs", &self.keepalive_secs)
            .finish()
    }
}

fn check_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<bool, russh::keys::Error> {
    match known_hosts_path {
        Some(path) => russh::keys::check_known_hosts_path(host, port, key, path),
        None => russh::keys::check_known_hosts(host, port, key),
    }
}

fn learn_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<(), russh::keys::Error> {
    match known_hosts_path {
        Some(path) => learn_known_hosts_path(host, port, key, path),
        None => learn_known_hosts(host, port, key),
    }
}

/// Accepts keys already in known_hosts (by name, then by IP) and learns
/// unknown ones. A changed key is an error.
fn verify_server_key(
    host: &str,
    addr: SocketAddr,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<bool, anyhow::Error> {
    let port = addr.port();
    let ip_host = addr.ip().to_string();
    let mut candidates = vec![host.to_string()];
    if ip_host != host {
        candidates.push(ip_host);
    }
    for candidate in &candidates {
        match check_known_hosts_for(candidate, port, key, known_hosts_path) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!("server key validation failed for {host}:{port}: {err}");
                return Err(anyhow!(
                    "server key validation failed for {host}:{port}: {err}"
                ));
            }
        }
    }

    tracing::info!(
        "server key for {host}:{port} is not present in known_hosts (tried {}); learning",
        candidates.join(", ")
    );
    learn_known_hosts_for(host, port, key, known_hosts_path).map_err(|err| {
        tracing::warn!("failed to learn server key for {host}:{port}: {err}");
        anyhow!("failed to learn server key for {host}:{port}: {err}")
    })?;
    Ok(true)
}

/// Owns the single SSH connection of a controller run.
pub struct SessionManager {
    params: SshParams,
    config: Arc<Config>,
    // Commands and transfers are serialized through this lock.
    handle: Arc<Mutex<Option<russh::client::Handle<ClientHandler>>>>,
    keepalive_task_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SessionManager {
    pub fn new(params: SshParams) -> Self {
        let cfg = Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(params.keepalive_secs.max(1))),
            channel_buffer_size: 64,
            window_size: 1024 * 1024,
            ..Default::default()
        };
        Self {
            params,
            config: Arc::new(cfg),
            handle: Arc::new(Mutex::new(None)),
            keepalive_task_handle: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.keepalive_task_handle.lock().await.take() {
            task.abort();
        }
        let mut handle_field = self.handle.lock().await;
        if let Some(handle) = handle_field.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const KEY_B64: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIJdD7y3aLq454yWBdwLWbieU1ebz9/cu7/QEXn9OIeZJ";

    fn params() -> SshParams {
        SshParams {
            host: "127.0.0.1".to_string(),
            addr: "127.0.0.1:22".parse::<SocketAddr>().unwrap(),
            username: "alice".to_string(),
            identity_path: None,
            password: Some("hunter2".to_string()),
            known_hosts_path: None,
            keepalive_secs: 1,
        }
    }

    #[test]
    fn debug_output_hides_password() {
        let rendered = format!("{:?}", params());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn verify_server_key_accepts_known_host() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("known_hosts");
        fs::write(&path, format!("cluster.example.org ssh-ed25519 {KEY_B64}\n")).unwrap();
        let key = russh::keys::parse_public_key_base64(KEY_B64).unwrap();
        let addr = "203.0.113.10:22".parse::<SocketAddr>().unwrap();

        let ok = verify_server_key("cluster.example.org", addr, &key, Some(&path)).unwrap();
        assert!(ok);
    }

    #[test]
    fn verify_server_key_accepts_ip_fallback() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("known_hosts");
        fs::write(&path, format!("203.0.113.10 ssh-ed25519 {KEY_B64}\n")).unwrap();
        let key = russh::keys::parse_public_key_base64(KEY_B64).unwrap();
        let addr = "203.0.113.10:22".parse::<SocketAddr>().unwrap();

        let ok = verify_server_key("cluster.example.org", addr, &key, Some(&path)).unwrap();
        assert!(ok);
    }

    #[test]
    fn verify_server_key_learns_unknown_host() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("known_hosts");
        let key = russh::keys::parse_public_key_base64(KEY_B64).unwrap();
        let addr = "203.0.113.10:22".parse::<SocketAddr>().unwrap();

        let ok = verify_server_key("new.example.org", addr, &key, Some(&path)).unwrap();
        assert!(ok);

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("new.example.org"));
        assert!(contents.contains(KEY_B64));
    }

    #[test]
    fn verify_server_key_rejects_changed_key() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("known_hosts");
        let changed = "AAAAC3NzaC1lZDI1NTE5AAAAILIG2T/B0l0gaqj3puu510tu9N1OkQ4znY3LYuEm5zCF";
        fs::write(&path, format!("cluster.example.org ssh-ed25519 {KEY_B64}\n")).unwrap();
        let changed_key = russh::keys::parse_public_key_base64(changed).unwrap();
        let addr = "203.0.113.10:22".parse::<SocketAddr>().unwrap();

        assert!(verify_server_key("cluster.example.org", addr, &changed_key, Some(&path)).is_err());
    }
}
