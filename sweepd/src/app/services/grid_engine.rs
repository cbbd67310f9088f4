// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Command lines and output parsing for qstat/qsub/qdel style grid engines.

use std::path::Path;

use sweepcore::model::{QueueEntry, QueueState};
use sweepcore::shell::sh_escape;
use time::PrimitiveDateTime;
use time::macros::format_description;

/// Prefix of the qsub response when the engine refuses a job outright.
pub const REJECTION_MARKER: &str = "Unable to run job";

const FULL_NAME_MARKER: &str = "Full jobname:";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("job line has {found} columns, expected at least 5: '{line}'")]
    MissingColumns { found: usize, line: String },
    #[error("job id '{0}' is not a number")]
    InvalidId(String),
    #[error("job {0} has no 'Full jobname:' line")]
    MissingFullName(u64),
    #[error("'Full jobname:' line without a preceding job line")]
    OrphanFullName,
}

pub fn list_command(owner: &str) -> String {
    format!("qstat -u {} -r", sh_escape(owner))
}

/// Output and errors are joined into one file inside the job directory.
pub fn submit_command(job_dir: &Path, script: &Path) -> String {
    format!(
        "qsub -j y -o {} {}",
        sh_escape(&job_dir.to_string_lossy()),
        sh_escape(&script.to_string_lossy())
    )
}

pub fn cancel_command(queue_id: u64) -> String {
    format!("qdel -f {queue_id}")
}

struct PendingRecord {
    queue_id: u64,
    owner: String,
    state_code: String,
    since: Option<PrimitiveDateTime>,
}

/// Parses `qstat -r` output.
///
/// Every job is a line starting with its numeric id
/// (`id priority name owner state date time ...`) followed, among the
/// resource lines, by `Full jobname: <name>`. The name column of the first
/// line is truncated by qstat, so the full name line is authoritative and
/// the two are paired positionally. Header and separator lines are skipped.
pub fn parse_qstat(output: &str) -> Result<Vec<QueueEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut pending: Option<PendingRecord> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
            if let Some(record) = pending.take() {
                return Err(ParseError::MissingFullName(record.queue_id));
            }
            pending = Some(parse_job_line(trimmed)?);
        } else if let Some(rest) = trimmed.strip_prefix(FULL_NAME_MARKER) {
            let record = pending.take().ok_or(ParseError::OrphanFullName)?;
            entries.push(QueueEntry {
                queue_id: record.queue_id,
                name: rest.trim().to_string(),
                owner: record.owner,
                state: QueueState::from_code(&record.state_code),
                state_code: record.state_code,
                since: record.since,
            });
        }
    }
    if let Some(record) = pending {
        return Err(ParseError::MissingFullName(record.queue_id));
    }
    Ok(entries)
}

fn parse_job_line(line: &str) -> Result<PendingRecord, ParseError> {
    let columns: Vec<&str> = line.split_whitespace().collect();
    if columns.len() < 5 {
        return Err(ParseError::MissingColumns {
            found: columns.len(),
            line: line.to_string(),
        });
    }
    let queue_id = columns[0]
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidId(columns[0].to_string()))?;
    let since = match (columns.get(5), columns.get(6)) {
        (Some(date), Some(time)) => parse_timestamp(date, time),
        _ => None,
    };
    Ok(PendingRecord {
        queue_id,
        owner: columns[3].to_string(),
        state_code: columns[4].to_string(),
        since,
    })
}

fn parse_timestamp(date: &str, time: &str) -> Option<PrimitiveDateTime> {
    let format = format_description!("[month]/[day]/[year] [hour]:[minute]:[second]");
    PrimitiveDateTime::parse(&format!("{date} {time}"), &format).ok()
}

/// Job id from `Your job 4242 ("name") has been submitted`.
pub fn parse_submit_response(output: &str) -> Option<u64> {
    let mut words = output.split_whitespace();
    while let Some(word) = words.next() {
        if word == "job" || word == "job-array" {
            if let Some(id) = words
                .next()
                .and_then(|id| id.split('.').next())
                .and_then(|id| id.parse::<u64>().ok())
            {
                return Some(id);
            }
        }
    }
    None
}

pub fn is_rejection(output: &str) -> bool {
    output.trim_start().starts_with(REJECTION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const SAMPLE: &str = "\
job-ID  prior   name       user         state submit/start at     queue                          slots ja-task-ID
-----------------------------------------------------------------------------------------------------------------
 181504 0.50500 lattice_a0 alice        r     08/14/2024 10:22:05 all.q@node-12.cluster              1
       Full jobname:     lattice_a0.5_seed1
       Master Queue:     all.q@node-12.cluster
       Hard Resources:   h_rt=86400 (0.000000)
 181505 0.00000 lattice_a0 alice        qw    08/14/2024 10:21:59                                    1
       Full jobname:     lattice_a0.5_seed2
 181506 0.50500 lattice_a1 alice        Eqw   08/14/2024 10:22:01                                    1
       Full jobname:     lattice_a1.0_seed1
";

    #[test]
    fn parse_qstat_pairs_job_and_name_lines() {
        let entries = parse_qstat(SAMPLE).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].queue_id, 181504);
        assert_eq!(entries[0].name, "lattice_a0.5_seed1");
        assert_eq!(entries[0].owner, "alice");
        assert_eq!(entries[0].state, QueueState::Running);
        assert_eq!(entries[0].since, Some(datetime!(2024-08-14 10:22:05)));
        assert_eq!(entries[1].state, QueueState::Queued);
        assert_eq!(entries[1].name, "lattice_a0.5_seed2");
        assert!(entries[2].is_error());
        assert_eq!(entries[2].state_code, "Eqw");
    }

    #[test]
    fn parse_qstat_accepts_empty_listing() {
        assert!(parse_qstat("").unwrap().is_empty());
        assert!(parse_qstat("\n\n").unwrap().is_empty());
    }

    #[test]
    fn parse_qstat_rejects_short_job_line() {
        let err = parse_qstat("181504 0.5 name\n Full jobname: name\n").unwrap_err();
        assert!(matches!(err, ParseError::MissingColumns { found: 3, .. }));
    }

    #[test]
    fn parse_qstat_rejects_unpaired_lines() {
        let missing = " 1 0.5 a alice r 08/14/2024 10:22:05\n 2 0.5 b alice r 08/14/2024 10:22:05\n";
        assert_eq!(parse_qstat(missing).unwrap_err(), ParseError::MissingFullName(1));

        let trailing = " 1 0.5 a alice r 08/14/2024 10:22:05\n";
        assert_eq!(parse_qstat(trailing).unwrap_err(), ParseError::MissingFullName(1));

        let orphan = "   Full jobname: a\n";
        assert_eq!(parse_qstat(orphan).unwrap_err(), ParseError::OrphanFullName);
    }

    #[test]
    fn parse_qstat_tolerates_missing_timestamp() {
        let entries = parse_qstat(" 7 0.5 a alice qw\n  Full jobname: a\n").unwrap();
        assert_eq!(entries[0].since, None);
    }

    #[test]
    fn parse_submit_response_extracts_job_id() {
        assert_eq!(
            parse_submit_response("Your job 4242 (\"lattice_a\") has been submitted\n"),
            Some(4242)
        );
        assert_eq!(
            parse_submit_response("Your job-array 77.1-10:1 (\"arr\") has been submitted"),
            Some(77)
        );
        assert_eq!(parse_submit_response("something else"), None);
    }

    #[test]
    fn rejection_marker_is_detected_at_start() {
        assert!(is_rejection("Unable to run job: job rejected: no suitable queues.\nExiting."));
        assert!(!is_rejection("Your job 1 (\"x\") has been submitted"));
    }

    #[test]
    fn commands_quote_paths() {
        assert_eq!(list_command("alice"), "qstat -u 'alice' -r");
        assert_eq!(
            submit_command(Path::new("/runs/j 1"), Path::new("/runs/j 1/job.sh")),
            "qsub -j y -o '/runs/j 1' '/runs/j 1/job.sh'"
        );
        assert_eq!(cancel_command(12), "qdel -f 12");
    }
}
