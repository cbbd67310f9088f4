// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;

use async_trait::async_trait;
use sweepcore::model::{Job, QueueEntry};
use thiserror::Error;

use crate::app::services::grid_engine::ParseError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue listing could not be parsed: {0}")]
    Parse(#[from] ParseError),
    #[error("queue rejected job {queue_name}: {message}")]
    Rejected { queue_name: String, message: String },
    #[error("queue command `{command}` failed: {message}")]
    Command { command: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub queue_name: String,
    pub queue_id: Option<u64>,
}

#[async_trait]
/// Boundary to the batch scheduler.
/// Keeps the text formats of a particular engine out of the driver loop.
pub trait QueuePort: Send + Sync {
    /// Snapshot of every job `owner` has in the queue.
    async fn list_jobs(&self, owner: &str) -> Result<Vec<QueueEntry>, QueueError>;

    /// Hands `script` to the scheduler, with the job's output collected in its directory.
    async fn submit(&self, job: &Job, script: &Path) -> Result<SubmitReceipt, QueueError>;

    /// Forced removal. Best effort: failures are logged by the implementation.
    async fn cancel(&self, queue_id: u64);
}
