// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sweepcore::errors::{AppError, AppErrorKind, AppResult, codes};
use sweepcore::exec::ExecCapture;

use crate::app::ports::RemotePort;

mod error;
mod session;

pub use error::AuthenticationFailure;
pub use session::{SessionManager, SshParams};

use session::{is_missing_path, is_permission_denied};

/// [`RemotePort`] over one SSH connection, SFTP for file operations.
#[derive(Clone)]
pub struct SshRemote {
    session: Arc<SessionManager>,
}

impl SshRemote {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    async fn connected(&self) -> AppResult<&SessionManager> {
        self.session
            .ensure_connected()
            .await
            .map_err(map_connect_error)?;
        Ok(self.session.as_ref())
    }
}

fn ssh_error_code(err: &anyhow::Error) -> &'static str {
    if err.chain().any(|cause| cause.is::<AuthenticationFailure>()) {
        codes::AUTHENTICATION_FAILURE
    } else {
        codes::CONNECTION_FAILURE
    }
}

fn map_connect_error(err: anyhow::Error) -> AppError {
    let code = ssh_error_code(&err);
    let kind = if code == codes::AUTHENTICATION_FAILURE {
        AppErrorKind::Unauthenticated
    } else {
        AppErrorKind::Unavailable
    };
    AppError::with_message(kind, code, format!("ssh connect failed: {err:#}"))
}

fn map_exec_error(err: anyhow::Error) -> AppError {
    AppError::with_message(
        AppErrorKind::Internal,
        codes::REMOTE_ERROR,
        format!("ssh exec failed: {err:#}"),
    )
}

fn sftp_cause(err: &anyhow::Error, pred: fn(&russh_sftp::client::error::Error) -> bool) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<russh_sftp::client::error::Error>()
            .is_some_and(pred)
    })
}

fn is_local_permission_denied(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::PermissionDenied)
    })
}

fn map_landing_error(path: &str, err: anyhow::Error) -> AppError {
    if sftp_cause(&err, is_permission_denied) {
        return AppError::with_message(
            AppErrorKind::PermissionDenied,
            codes::PERMISSION_DENIED,
            format!("cannot create remote directory {path}: {err:#}"),
        );
    }
    AppError::with_message(
        AppErrorKind::Internal,
        codes::TRANSFER_ERROR,
        format!("cannot create remote directory {path}: {err:#}"),
    )
}

fn map_transfer_error(op: &str, path: &str, err: anyhow::Error) -> AppError {
    let (kind, code) = if sftp_cause(&err, is_missing_path) {
        (AppErrorKind::NotFound, codes::NOT_FOUND)
    } else if sftp_cause(&err, is_permission_denied) || is_local_permission_denied(&err) {
        (AppErrorKind::PermissionDenied, codes::PERMISSION_DENIED)
    } else {
        (AppErrorKind::Internal, codes::TRANSFER_ERROR)
    };
    AppError::with_message(kind, code, format!("{op} {path} failed: {err:#}"))
}

#[async_trait]
impl RemotePort for SshRemote {
    #[tracing::instrument(name = "ssh", level = "debug", skip(self), fields(op = "connect"))]
    async fn connect(&self) -> AppResult<()> {
        self.connected().await.map(|_| ())
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self), fields(op = "exec"))]
    async fn run(&self, command: &str) -> AppResult<ExecCapture> {
        self.connected()
            .await?
            .exec_capture(command)
            .await
            .map_err(map_exec_error)
    }

    async fn ensure_landed(&self, path: &str) -> AppResult<()> {
        self.connected()
            .await?
            .ensure_remote_dir(path)
            .await
            .map_err(|err| map_landing_error(path, err))
    }

    async fn exists(&self, path: &str) -> AppResult<bool> {
        self.connected()
            .await?
            .remote_exists(path)
            .await
            .map_err(|err| map_transfer_error("stat", path, err))
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self), fields(op = "put"))]
    async fn put(&self, local: &Path, remote: &str) -> AppResult<()> {
        self.connected()
            .await?
            .upload_file(local, remote)
            .await
            .map_err(|err| map_transfer_error("upload to", remote, err))
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self), fields(op = "get"))]
    async fn get(&self, remote: &str, local: &Path) -> AppResult<()> {
        self.connected()
            .await?
            .download_file(remote, local)
            .await
            .map_err(|err| map_transfer_error("download of", remote, err))
    }

    async fn remove_file(&self, remote: &str) -> AppResult<()> {
        self.connected()
            .await?
            .remove_remote_file(remote)
            .await
            .map_err(|err| map_transfer_error("removal of", remote, err))
    }

    async fn disconnect(&self) {
        self.session.shutdown().await;
    }
}
