// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Path, PathBuf};

use sweepcore::archive::{self, ExcludeSet};
use sweepcore::errors::{AppError, AppErrorKind, AppResult, codes};
use sweepcore::layout::DRIVER_BINARY;
use tempfile::NamedTempFile;

/// Zips the driver bundle into a temporary file that lives as long as the handle.
pub async fn pack(bundle_dir: &Path) -> AppResult<NamedTempFile> {
    let binary = bundle_dir.join(DRIVER_BINARY);
    if !binary.is_file() {
        return Err(AppError::with_message(
            AppErrorKind::NotFound,
            codes::NOT_FOUND,
            format!(
                "driver bundle {} has no {DRIVER_BINARY} binary",
                bundle_dir.display()
            ),
        ));
    }
    let bundle_dir: PathBuf = bundle_dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> AppResult<NamedTempFile> {
        let temp = tempfile::Builder::new()
            .prefix("sweep-driver-")
            .suffix(".zip")
            .tempfile()
            .map_err(|err| {
                AppError::with_message(
                    AppErrorKind::Internal,
                    codes::LOCAL_ERROR,
                    format!("failed to create temporary file: {err}"),
                )
            })?;
        let entries = archive::pack_dir(&bundle_dir, temp.path(), &ExcludeSet::empty())
            .map_err(|err| {
                AppError::with_message(
                    AppErrorKind::Internal,
                    codes::ARCHIVE_ERROR,
                    format!("failed to pack driver bundle: {err}"),
                )
            })?;
        tracing::debug!(entries, bundle = %bundle_dir.display(), "driver bundle packed");
        Ok(temp)
    })
    .await
    .map_err(|err| {
        AppError::with_message(
            AppErrorKind::Internal,
            codes::INTERNAL_ERROR,
            format!("bundle task failed: {err}"),
        )
    })?
}
