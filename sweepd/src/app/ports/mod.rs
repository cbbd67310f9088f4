// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

mod queue;
mod shell;

pub use queue::{QueueError, QueuePort, SubmitReceipt};
pub use shell::ShellPort;
