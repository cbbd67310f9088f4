// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use sweepcore::errors::AppResult;
use sweepcore::exec::ExecCapture;

#[async_trait]
/// Runs a command line through the login shell of the head node.
pub trait ShellPort: Send + Sync {
    async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture>;
}
