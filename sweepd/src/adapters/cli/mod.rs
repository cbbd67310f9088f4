// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "sweepd",
    version,
    about = "Submits a batch of jobs to the grid engine, cleans up after them and archives the results.",
    long_about = None,
    after_help = "Started detached on the cluster head node by `sweep`.\n\
\n\
Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: next to the binary < SWEEPD_CONFIG_PATH < command-line flags.\n\
When the run finishes, <run-dir>.zip and <run-dir>_completion_flag are written next to the run directory."
)]
pub struct Opts {
    #[arg(
        long,
        value_name = "DIR",
        help = "Run directory holding the uploaded batch archive."
    )]
    pub run_dir: PathBuf,
    #[arg(
        long,
        value_name = "NAME",
        help = "Batch name used to derive job names. Defaults to the name of the run directory's parent."
    )]
    pub batch: Option<String>,
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, sweepd uses SWEEPD_CONFIG_PATH if set, otherwise sweepd.toml next to the binary if present."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        value_name = "N",
        help = "Maximum number of this run's jobs in the queue at once. Overrides `max_parallel_jobs` from the config file."
    )]
    pub max_parallel_jobs: Option<usize>,
    #[arg(
        long,
        value_name = "SECS",
        help = "Give up waiting for submitted jobs after this long. Overrides `drain_timeout_secs` from the config file."
    )]
    pub drain_timeout_secs: Option<u64>,
    #[arg(
        long,
        value_name = "USER",
        help = "Queue owner whose jobs are listed. Overrides `queue_owner` from the config file."
    )]
    pub queue_owner: Option<String>,
    #[arg(
        short,
        long,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
}

impl Opts {
    pub fn batch_name(&self) -> Option<String> {
        self.batch.clone().or_else(|| {
            self.run_dir
                .parent()
                .and_then(|parent| parent.file_name())
                .map(|name| name.to_string_lossy().to_string())
        })
    }
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

pub fn cli_command() -> clap::Command {
    Opts::command()
}

pub fn parse_opts() -> ParsedOpts {
    let matches = cli_command().get_matches();
    let verbose_override = if matches.get_flag("verbose") {
        Some(true)
    } else {
        None
    };
    let opts = Opts::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    ParsedOpts {
        opts,
        verbose_override,
    }
}
