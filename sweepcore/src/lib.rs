// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod archive;
pub mod clock;
pub mod errors;
pub mod exec;
pub mod layout;
pub mod logging;
pub mod model;
pub mod shell;
