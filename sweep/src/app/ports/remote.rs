// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;

use async_trait::async_trait;
use sweepcore::errors::AppResult;
use sweepcore::exec::ExecCapture;

#[async_trait]
/// Command and file-transfer channel to the cluster head node.
/// Remote paths are absolute POSIX strings.
pub trait RemotePort: Send + Sync {
    /// Opens and authenticates the channel. Failures are fatal for the run.
    async fn connect(&self) -> AppResult<()>;

    async fn run(&self, command: &str) -> AppResult<ExecCapture>;

    /// Creates `path` and its ancestors; an existing directory is success.
    async fn ensure_landed(&self, path: &str) -> AppResult<()>;

    async fn exists(&self, path: &str) -> AppResult<bool>;

    async fn put(&self, local: &Path, remote: &str) -> AppResult<()>;

    async fn get(&self, remote: &str, local: &Path) -> AppResult<()>;

    async fn remove_file(&self, remote: &str) -> AppResult<()>;

    async fn disconnect(&self);
}
