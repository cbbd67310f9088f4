// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;
use std::path::Path;
use tokio::fs as tokiofs;
use tokio::io::AsyncWriteExt;

use super::SessionManager;

impl SessionManager {
    async fn sftp(&self) -> Result<SftpSession> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| anyhow!("SSH handle lost before opening SFTP"))?;
        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        Ok(sftp)
    }

    /// Creates `remote_dir` and its missing ancestors.
    pub async fn ensure_remote_dir(&self, remote_dir: &str) -> Result<()> {
        let sftp = self.sftp().await?;
        tracing::debug!("remote dir: {remote_dir}");
        for cur in build_remote_dir_paths(remote_dir) {
            match sftp.metadata(&cur).await {
                Ok(meta) => {
                    if !meta.is_dir() {
                        return Err(anyhow!(
                            "remote path exists but is not a directory: {}",
                            cur
                        ));
                    }
                }
                Err(e) => {
                    tracing::debug!("got error when retrieving metadata for {}: {}", &cur, e);
                    sftp.create_dir(&cur)
                        .await
                        .with_context(|| format!("creating path {}", &cur))?;
                }
            }
        }
        Ok(())
    }

    pub async fn remote_exists(&self, remote_path: &str) -> Result<bool> {
        let sftp = self.sftp().await?;
        Ok(sftp.try_exists(remote_path).await?)
    }

    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        tracing::debug!(
            "uploading file over sftp: {} -> {}",
            local_path.display(),
            remote_path
        );
        let sftp = self.sftp().await?;
        let mut lfile = tokiofs::File::open(local_path)
            .await
            .with_context(|| format!("opening local file {}", local_path.display()))?;
        let mut rfile = sftp
            .create(remote_path)
            .await
            .with_context(|| format!("creating remote file {remote_path}"))?;
        tokio::io::copy(&mut lfile, &mut rfile).await?;
        rfile.flush().await?;
        rfile.shutdown().await?;
        Ok(())
    }

    pub async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        tracing::debug!(
            "downloading file over sftp: {} -> {}",
            remote_path,
            local_path.display()
        );
        let sftp = self.sftp().await?;
        if let Some(parent) = local_path.parent() {
            tokiofs::create_dir_all(parent).await?;
        }
        let mut rfile = sftp.open(remote_path).await?;
        let mut lfile = tokiofs::File::create(local_path)
            .await
            .with_context(|| format!("creating local file {}", local_path.display()))?;
        tokio::io::copy(&mut rfile, &mut lfile).await?;
        lfile.flush().await?;
        Ok(())
    }

    pub async fn remove_remote_file(&self, remote_path: &str) -> Result<()> {
        let sftp = self.sftp().await?;
        sftp.remove_file(remote_path).await?;
        Ok(())
    }
}

/// Every prefix of an absolute or relative remote directory, shortest first.
/// `/a/b` yields `["/a", "/a/b"]`.
fn build_remote_dir_paths(remote_dir: &str) -> Vec<String> {
    let absolute = remote_dir.starts_with('/');
    let mut cur = String::new();
    let mut paths = Vec::new();
    for part in remote_dir.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if !cur.is_empty() || absolute {
            cur.push('/');
        }
        cur.push_str(part);
        paths.push(cur.clone());
    }
    paths
}

pub(crate) fn is_permission_denied(err: &SftpError) -> bool {
    match err {
        SftpError::Status(status) => status.status_code == StatusCode::PermissionDenied,
        SftpError::IO(msg) => msg.to_lowercase().contains("permission denied"),
        _ => false,
    }
}

pub(crate) fn is_missing_path(err: &SftpError) -> bool {
    matches!(err, SftpError::Status(status) if status.status_code == StatusCode::NoSuchFile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_dir_paths_for_absolute_dir() {
        assert_eq!(
            build_remote_dir_paths("/scratch/alice/sweep"),
            vec!["/scratch", "/scratch/alice", "/scratch/alice/sweep"]
        );
    }

    #[test]
    fn remote_dir_paths_for_relative_dir() {
        assert_eq!(
            build_remote_dir_paths("sweep//runs/"),
            vec!["sweep", "sweep/runs"]
        );
        assert!(build_remote_dir_paths("/").is_empty());
    }

    #[test]
    fn permission_denied_detection() {
        assert!(is_permission_denied(&SftpError::IO(
            "Permission denied (os error 13)".to_string()
        )));
        assert!(!is_permission_denied(&SftpError::IO("broken pipe".to_string())));
        assert!(!is_permission_denied(&SftpError::Timeout));
    }
}
