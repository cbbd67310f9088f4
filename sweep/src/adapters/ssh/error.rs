// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use thiserror::Error as ThisError;

/// The server turned every login attempt down. Mapped to `Unauthenticated`.
#[derive(Debug, ThisError)]
pub enum AuthenticationFailure {
    #[error("no password available for {user}; set the password environment variable or use an identity file")]
    NoPassword { user: String },
    #[error("{method} authentication rejected for {user}")]
    Rejected { user: String, method: &'static str },
    #[error("keyboard-interactive authentication for {user} still prompting after {rounds} rounds")]
    TooManyPrompts { user: String, rounds: usize },
}
