// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! `batch_log.csv`: one line per launched run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use sweepcore::errors::{AppError, AppErrorKind, AppResult, codes};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn history_line(at: OffsetDateTime, batch: &str, run_index: u32) -> AppResult<String> {
    let stamp = at.format(&Rfc3339).map_err(|err| {
        AppError::with_message(
            AppErrorKind::Internal,
            codes::INTERNAL_ERROR,
            format!("failed to format timestamp: {err}"),
        )
    })?;
    Ok(format!("{stamp},{batch},{run_index}\n"))
}

pub fn append(path: &Path, at: OffsetDateTime, batch: &str, run_index: u32) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|err| AppError::local_io("failed to create", parent, err))?;
    }
    let line = history_line(at, batch, run_index)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| AppError::local_io("failed to open", path, err))?;
    file.write_all(line.as_bytes())
        .map_err(|err| AppError::local_io("failed to append to", path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::macros::datetime;

    #[test]
    fn appends_one_line_per_run() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("batch_log.csv");
        append(&path, datetime!(2026-05-04 10:30 UTC), "lattice", 1).unwrap();
        append(&path, datetime!(2026-05-05 08:00 UTC), "lattice", 2).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "2026-05-04T10:30:00Z,lattice,1\n2026-05-05T08:00:00Z,lattice,2\n"
        );
    }
}
