// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::env;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, Registry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const FILTER_ENV: &str = "SWEEP_LOG";
const FORMAT_ENV: &str = "SWEEP_LOG_FORMAT";
const SPAN_EVENTS_ENV: &str = "SWEEP_LOG_SPAN_EVENTS";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    /// Plain-text copy of every record. The parent directory must exist.
    pub file: Option<PathBuf>,
}

pub fn init(options: &LogOptions) {
    let filter = build_filter(options.verbose);
    let span_events = parse_span_events(env::var(SPAN_EVENTS_ENV).ok().as_deref());
    let format = parse_format(env::var(FORMAT_ENV).ok().as_deref());
    let registry = Registry::default()
        .with(filter)
        .with(tracing_error::ErrorLayer::default());

    // The file always gets compact text so it stays readable inside result archives.
    let file_layer = options.file.as_deref().and_then(build_file_writer).map(|writer| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(false)
            .with_timer(UtcTime::rfc_3339())
            .with_span_events(span_events.clone())
            .with_writer(writer)
    });
    let registry = registry.with(file_layer);

    match format {
        LogFormat::Json => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(span_events);
            registry.with(stdout_layer).init();
        }
        LogFormat::Pretty => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(span_events);
            registry.with(stdout_layer).init();
        }
        LogFormat::Compact => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(span_events);
            registry.with(stdout_layer).init();
        }
    }
}

fn build_filter(verbose: bool) -> EnvFilter {
    match env::var(FILTER_ENV) {
        Ok(value) => EnvFilter::new(value),
        Err(_) => {
            if verbose {
                EnvFilter::new("debug")
            } else {
                EnvFilter::new("info")
            }
        }
    }
}

fn normalized(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_ascii_lowercase())
}

fn parse_format(value: Option<&str>) -> LogFormat {
    match normalized(value).as_deref() {
        Some("json") => LogFormat::Json,
        Some("pretty") => LogFormat::Pretty,
        _ => LogFormat::Compact,
    }
}

fn parse_span_events(value: Option<&str>) -> FmtSpan {
    match normalized(value).as_deref() {
        Some("new") => FmtSpan::NEW,
        Some("enter") => FmtSpan::ENTER,
        Some("exit") => FmtSpan::EXIT,
        Some("close") => FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    }
}

/// Blocking appender: the driver archives its own log right after the last
/// record, so nothing may sit in a background buffer.
fn build_file_writer(path: &Path) -> Option<RollingFileAppender> {
    let file_name = path.file_name()?.to_string_lossy().to_string();
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
    {
        Ok(appender) => Some(appender),
        Err(err) => {
            eprintln!("cannot open log file {}: {err}", path.display());
            None
        }
    }
}
