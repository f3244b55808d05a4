// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! `log` backend that writes lines in the agent log format:
//!
//! ```text
//! 2026-01-02 15:04:05 UTC | WORKERPOOL | INFO | (src/worker.rs:88 in dd_workerpool::worker) | pid=123 | message
//! ```
//!
//! The pid is read per record so that processes forked after `init` tag their
//! own lines correctly.

use log::{LevelFilter, Log, Metadata, Record};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

#[derive(Debug)]
pub enum InitError {
    /// The log file could not be opened for appending.
    Io(io::Error),
    /// Another logger was already installed.
    AlreadySet(log::SetLoggerError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Io(e) => write!(f, "opening log file: {e}"),
            InitError::AlreadySet(e) => write!(f, "installing logger: {e}"),
        }
    }
}

impl std::error::Error for InitError {}

enum Sink {
    Stderr,
    File(File),
}

pub struct AgentLogger {
    component: String,
    level: LevelFilter,
    sink: Mutex<Sink>,
}

impl AgentLogger {
    /// Logger writing to stderr.
    pub fn stderr(component: &str, level: LevelFilter) -> Self {
        Self {
            component: component.to_uppercase(),
            level,
            sink: Mutex::new(Sink::Stderr),
        }
    }

    /// Logger appending to `path`, creating it if needed.
    pub fn file(component: &str, level: LevelFilter, path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            component: component.to_uppercase(),
            level,
            sink: Mutex::new(Sink::File(file)),
        })
    }

    pub fn format_record(&self, record: &Record<'_>) -> String {
        let now = OffsetDateTime::now_utc();
        let ts = now
            .format(TIMESTAMP_FORMAT)
            .unwrap_or_else(|_| now.unix_timestamp().to_string());
        format!(
            "{ts} UTC | {} | {} | ({}:{} in {}) | pid={} | {}",
            self.component,
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.module_path().unwrap_or("unknown"),
            std::process::id(),
            record.args()
        )
    }
}

impl Log for AgentLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format_record(record);
        // A poisoned lock only means another thread panicked mid-write.
        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Logging must never fail the caller; write errors are dropped.
        let _ = match &mut *sink {
            Sink::Stderr => writeln!(io::stderr().lock(), "{line}"),
            Sink::File(file) => writeln!(file, "{line}"),
        };
    }

    fn flush(&self) {
        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = match &mut *sink {
            Sink::Stderr => io::stderr().flush(),
            Sink::File(file) => file.flush(),
        };
    }
}

/// Parse a level name such as `info` or `DEBUG`. Unknown names yield `None`.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    LevelFilter::from_str(name.trim()).ok()
}

/// Install the agent logger as the global `log` backend.
pub fn init(component: &str, level: LevelFilter, file: Option<&Path>) -> Result<(), InitError> {
    let logger = match file {
        Some(path) => AgentLogger::file(component, level, path).map_err(InitError::Io)?,
        None => AgentLogger::stderr(component, level),
    };
    log::set_boxed_logger(Box::new(logger)).map_err(InitError::AlreadySet)?;
    log::set_max_level(level);
    Ok(())
}
