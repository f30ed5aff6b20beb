// src/backend/script.rs

//! Monitored-script generation and log parsing.
//!
//! Every cluster backend wraps the user program in a small shell script that
//! appends structured records to a log file in the playground:
//!
//! ```text
//! start
//! before <label>
//! after <label>
//! success <timestamp>
//! failure <timestamp> <label> <exit>
//! ```
//!
//! Reading that log is the first thing `update` does; it is the source of
//! truth for the job's verdict, with the scheduler only consulted when the
//! log is inconclusive.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::host::shell_quote;

/// Per-run directory on the execution host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playground {
    pub root: PathBuf,
}

impl Playground {
    /// Pick a fresh playground under `base`.
    pub fn fresh(base: &Path) -> Self {
        Self {
            root: base.join(format!("run-{}", uuid::Uuid::new_v4())),
        }
    }

    pub fn script_path(&self) -> PathBuf {
        self.root.join("script.sh")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("monitor.log")
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.root.join("stdout")
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.root.join("stderr")
    }
}

/// Render the monitored script around `program`.
///
/// The program runs in a subshell so its own `exit` cannot skip the
/// bookkeeping; the script's exit code is the program's.
pub fn render_script(program: &str, log_path: &Path, label: &str) -> String {
    let log = shell_quote(&log_path.to_string_lossy());
    let label_q = shell_quote(label);
    format!(
        "#!/bin/sh\n\
         _gf_log() {{ printf '%s\\n' \"$*\" >> {log}; }}\n\
         _gf_log start\n\
         _gf_log \"before {label_q}\"\n\
         (\n\
         {program}\n\
         )\n\
         _gf_ret=$?\n\
         _gf_log \"after {label_q}\"\n\
         if [ \"$_gf_ret\" -eq 0 ]; then\n\
         \x20 _gf_log \"success $(date +%s)\"\n\
         else\n\
         \x20 _gf_log \"failure $(date +%s) {label_q} $_gf_ret\"\n\
         fi\n\
         exit \"$_gf_ret\"\n"
    )
}

/// One parsed record of the monitor log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorRecord {
    Start,
    Before(String),
    After(String),
    Success(i64),
    Failure { at: i64, label: String, exit: i32 },
}

/// Final verdict carried by the log, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure { label: String, exit: i32 },
}

/// Parse the log leniently: unknown or malformed lines are skipped (the
/// user program may share the file descriptor).
pub fn parse_monitor_log(text: &str) -> Vec<MonitorRecord> {
    let mut records = Vec::new();
    for line in text.lines() {
        let mut words = line.split_whitespace();
        let record = match words.next() {
            Some("start") => Some(MonitorRecord::Start),
            Some("before") => words.next().map(|l| MonitorRecord::Before(l.to_string())),
            Some("after") => words.next().map(|l| MonitorRecord::After(l.to_string())),
            Some("success") => words
                .next()
                .and_then(|ts| ts.parse().ok())
                .map(MonitorRecord::Success),
            Some("failure") => {
                let at = words.next().and_then(|ts| ts.parse().ok());
                let label = words.next().map(str::to_string);
                let exit = words.next().and_then(|e| e.parse().ok());
                match (at, label, exit) {
                    (Some(at), Some(label), Some(exit)) => {
                        Some(MonitorRecord::Failure { at, label, exit })
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        if let Some(record) = record {
            records.push(record);
        }
    }
    records
}

/// The last success/failure record decides; intermediate records do not.
pub fn last_verdict(records: &[MonitorRecord]) -> Option<Verdict> {
    records.iter().rev().find_map(|r| match r {
        MonitorRecord::Success(_) => Some(Verdict::Success),
        MonitorRecord::Failure { label, exit, .. } => Some(Verdict::Failure {
            label: label.clone(),
            exit: *exit,
        }),
        _ => None,
    })
}
