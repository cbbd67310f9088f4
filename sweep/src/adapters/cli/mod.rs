// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "sweep",
    version,
    about = "Runs a batch of simulation jobs on a remote grid engine cluster and brings the results back.",
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: default path < SWEEP_CONFIG_PATH < command-line flags.\n\
The SSH password, when needed, is read from the variable named by `password_env` (SWEEP_SSH_PASSWORD by default).\n\
Results are unpacked into <output>/<batch>/run_<index>."
)]
pub struct Opts {
    #[arg(
        short = 'p',
        long,
        value_name = "PATH",
        help = "Local batch archive holding jobs/<job>/ directories."
    )]
    pub archive: PathBuf,
    #[arg(
        short = 'n',
        long,
        value_name = "NAME",
        help = "Batch name. Defaults to the archive's file stem."
    )]
    pub batch: Option<String>,
    #[arg(
        long,
        value_name = "N",
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Run index. Defaults to one past the highest existing run of the batch."
    )]
    pub run_index: Option<u32>,
    #[arg(
        short,
        long,
        value_name = "DIR",
        default_value = ".",
        help = "Local directory receiving <batch>/run_<index> and the submission history."
    )]
    pub output: PathBuf,
    #[arg(
        short = 'z',
        long,
        value_name = "HOST",
        help = "Cluster head node. Overrides `host` from the config file."
    )]
    pub host: Option<String>,
    #[arg(
        long,
        value_name = "PORT",
        help = "SSH port. Overrides `port` from the config file."
    )]
    pub port: Option<u16>,
    #[arg(
        short = 'u',
        long,
        value_name = "USER",
        help = "SSH user name. Overrides `username` from the config file."
    )]
    pub user: Option<String>,
    #[arg(
        short = 'i',
        long,
        value_name = "PATH",
        help = "Private key for public key authentication. Overrides `identity_path` from the config file."
    )]
    pub identity: Option<PathBuf>,
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, sweep uses SWEEP_CONFIG_PATH if set, otherwise the default config path if present."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Log file. Defaults to <output>/<batch>/sweep.log. Overrides `log_file` from the config file."
    )]
    pub log_file: Option<PathBuf>,
    #[arg(
        short,
        long,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        cli_command().debug_assert();
    }

    #[test]
    fn short_flags_parse() {
        let opts = Opts::try_parse_from([
            "sweep",
            "-p",
            "lattice.zip",
            "-n",
            "lattice",
            "-o",
            "results",
            "-z",
            "cluster.example.org",
            "-u",
            "alice",
            "-i",
            "~/.ssh/id_ed25519",
            "--run-index",
            "3",
        ])
        .unwrap();
        assert_eq!(opts.archive, PathBuf::from("lattice.zip"));
        assert_eq!(opts.batch.as_deref(), Some("lattice"));
        assert_eq!(opts.output, PathBuf::from("results"));
        assert_eq!(opts.host.as_deref(), Some("cluster.example.org"));
        assert_eq!(opts.user.as_deref(), Some("alice"));
        assert_eq!(opts.run_index, Some(3));
        assert!(!opts.verbose);
    }

    #[test]
    fn output_defaults_to_current_dir() {
        let opts = Opts::try_parse_from(["sweep", "--archive", "b.zip"]).unwrap();
        assert_eq!(opts.output, PathBuf::from("."));
        assert!(opts.run_index.is_none());
    }

    #[test]
    fn run_index_zero_is_rejected() {
        assert!(Opts::try_parse_from(["sweep", "-p", "b.zip", "--run-index", "0"]).is_err());
    }

    #[test]
    fn archive_is_required() {
        assert!(Opts::try_parse_from(["sweep"]).is_err());
    }
}
