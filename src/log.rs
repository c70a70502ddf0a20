// SPDX-License-Identifier: MIT
// Copyright 2026. The mssql-ha Authors.

//! log.rs
//!
//! Line-oriented loggers for the helper binaries.
//!
//! The cluster manager consumes the helpers' output line by line, so all
//! reporting goes through fixed-prefix line loggers rather than a leveled
//! logging facade. Progress lines carry a timestamp; the machine-parsed
//! `SEQUENCE_NUMBER: ` stream does not.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Where a logger's lines end up.
#[derive(Debug, Clone)]
enum Sink {
    Stdout,
    Stderr,
    Capture(Arc<Mutex<Vec<String>>>),
}

/// A line logger with a fixed prefix.
///
/// Timestamped loggers emit `<prefix><yyyy/mm/dd HH:MM:SS> <message>`; raw
/// loggers emit `<prefix><message>`. Cloning a logger shares its sink.
#[derive(Debug, Clone)]
pub struct Logger {
    prefix: &'static str,
    timestamps: bool,
    sink: Sink,
}

impl Logger {
    /// Progress output: timestamped lines on stdout.
    pub fn stdout() -> Self {
        Logger {
            prefix: "",
            timestamps: true,
            sink: Sink::Stdout,
        }
    }

    /// Error output: timestamped lines on stderr with the given prefix.
    pub fn stderr(prefix: &'static str) -> Self {
        Logger {
            prefix,
            timestamps: true,
            sink: Sink::Stderr,
        }
    }

    /// Machine-readable stderr output: prefixed, no timestamp.
    pub fn stderr_raw(prefix: &'static str) -> Self {
        Logger {
            prefix,
            timestamps: false,
            sink: Sink::Stderr,
        }
    }

    /// A logger that collects its lines in memory, for tests. No timestamps
    /// so lines can be asserted verbatim.
    pub fn capture() -> Self {
        Logger {
            prefix: "",
            timestamps: false,
            sink: Sink::Capture(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// The lines collected by a capture logger. Empty for the stdio sinks.
    pub fn captured(&self) -> Vec<String> {
        match &self.sink {
            Sink::Capture(lines) => lines.lock().unwrap().clone(),
            _ => Vec::new(),
        }
    }

    /// Write one line.
    pub fn line(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let line = if self.timestamps {
            let now = chrono::Local::now().format("%Y/%m/%d %H:%M:%S");
            format!("{}{} {}", self.prefix, now, message)
        } else {
            format!("{}{}", self.prefix, message)
        };

        match &self.sink {
            Sink::Stdout => {
                let _ = writeln!(std::io::stdout().lock(), "{line}");
            }
            Sink::Stderr => {
                let _ = writeln!(std::io::stderr().lock(), "{line}");
            }
            Sink::Capture(lines) => lines.lock().unwrap().push(line),
        }
    }
}
