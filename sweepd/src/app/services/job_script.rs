// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;

use sweepcore::errors::{AppError, AppErrorKind, AppResult, codes};
use sweepcore::model::Job;
use sweepcore::shell::sh_escape;
use tera::Context;

/// Built-in Grid Engine submission script.
/// `job_dir` is already shell-quoted when it reaches the template.
pub const DEFAULT_TEMPLATE: &str = r#"#!/bin/bash
#$ -S /bin/bash
#$ -N {{ queue_name }}
job_dir={{ job_dir }}
cd "$job_dir" || exit 1
./{{ executable }}
"#;

/// Submission script template rendered once per job.
#[derive(Debug, Clone)]
pub struct JobScript {
    template: String,
    executable: String,
}

impl JobScript {
    /// Validates the template by rendering it for a placeholder job.
    pub fn new(template: String, executable: impl Into<String>) -> AppResult<Self> {
        let script = Self {
            template,
            executable: executable.into(),
        };
        let probe = Job::new("batch", Path::new("/probe/jobs/job").to_path_buf()).ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::INTERNAL_ERROR,
                "cannot build placeholder job",
            )
        })?;
        script.render(&probe)?;
        Ok(script)
    }

    pub fn builtin(executable: impl Into<String>) -> AppResult<Self> {
        Self::new(DEFAULT_TEMPLATE.to_string(), executable)
    }

    pub fn from_file(path: &Path, executable: impl Into<String>) -> AppResult<Self> {
        let template = std::fs::read_to_string(path)
            .map_err(|err| AppError::local_io("failed to read job template", path, err))?;
        Self::new(template, executable).map_err(|err| err.with_context(path.display().to_string()))
    }

    pub fn render(&self, job: &Job) -> AppResult<String> {
        let mut context = Context::new();
        context.insert("queue_name", job.queue_name());
        context.insert("job_id", job.id());
        context.insert("job_name", &job.dir_name());
        context.insert("job_dir", &sh_escape(&job.directory().to_string_lossy()));
        context.insert("executable", &self.executable);
        tera::Tera::one_off(&self.template, &context, false).map_err(|err| {
            AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                format!("job template render failed: {err}"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn builtin_template_embeds_queue_name_and_directory() {
        let script = JobScript::builtin("bond_switch_simulator.exe").unwrap();
        let job = Job::new("lattice", PathBuf::from("/runs/lattice_run_1/jobs/a 1")).unwrap();
        let rendered = script.render(&job).unwrap();
        assert!(rendered.contains("#$ -N lattice_a_1\n"));
        assert!(rendered.contains("job_dir='/runs/lattice_run_1/jobs/a 1'\n"));
        assert!(rendered.ends_with("./bond_switch_simulator.exe\n"));
    }

    #[test]
    fn custom_template_gets_job_fields() {
        let script = JobScript::new(
            "#$ -N {{ queue_name }}\n# {{ job_id }} {{ job_name }}\n".to_string(),
            "sim",
        )
        .unwrap();
        let job = Job::new("b", PathBuf::from("/r/jobs/x")).unwrap();
        assert_eq!(script.render(&job).unwrap(), "#$ -N b_x\n# b_x x\n");
    }

    #[test]
    fn broken_template_is_rejected_up_front() {
        let err = JobScript::new("{{ queue_name".to_string(), "sim").unwrap_err();
        assert_eq!(err.code(), codes::INVALID_ARGUMENT);

        let err = JobScript::new("{{ missing_value }}".to_string(), "sim").unwrap_err();
        assert!(err.message().contains("job template render failed"));
    }
}
