// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod grid_engine;
pub mod job_script;
pub mod workspace;
