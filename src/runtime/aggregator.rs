// src/runtime/aggregator.rs
//! Result aggregation
//!
//! Merges what the executor saw (exit status, output, timeout) with what the
//! monitor measured into one immutable [`CommandResult`].

use crate::runtime::process_manager::ExecOutcome;
use crate::runtime::resource_monitor::MonitorMetrics;
use crate::runtime::terminator::TerminationOutcome;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::io;
use std::time::Duration;

/// Terminal state of one command, exactly one per result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    CompletedOk,
    CompletedWithError,
    TimedOut,
    Aborted,
    /// Stopped because the governor shut down
    Interrupted,
    SpawnFailed,
    InternalError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::CompletedOk => "completed_ok",
            Outcome::CompletedWithError => "completed_with_error",
            Outcome::TimedOut => "timed_out",
            Outcome::Aborted => "aborted",
            Outcome::Interrupted => "interrupted",
            Outcome::SpawnFailed => "spawn_failed",
            Outcome::InternalError => "internal_error",
        }
    }
}

fn secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

fn opt_secs<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

/// Outcome of one governed command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    /// Program and arguments joined by spaces
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// Absent when the process was killed or never observed to exit
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub aborted: bool,
    /// Set iff `aborted`
    pub abort_reason: Option<String>,
    /// Time from breach start to abort, set iff `aborted`
    #[serde(serialize_with = "opt_secs")]
    pub time_to_abort: Option<Duration>,
    pub samples_collected: u64,
    pub peak_cpu: f64,
    pub peak_mem: f64,
    pub avg_cpu: f64,
    pub avg_mem: f64,
    pub dry_run_breaches: u32,
    pub outcome: Outcome,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(serialize_with = "secs")]
    pub elapsed: Duration,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::CompletedOk
    }
}

/// Wall-clock bounds of a command
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

const INTERRUPTED_NOTE: &str = "Interrupted: governor shut down before the command finished.";

fn with_note(stderr: String, note: String) -> String {
    if stderr.is_empty() {
        note
    } else {
        format!("{}\n{}", stderr, note)
    }
}

// The monitor is stopped before any timeout or shutdown escalation, so an
// abort recorded here always fired first.
fn classify(exec: &ExecOutcome, metrics: &MonitorMetrics) -> Outcome {
    if metrics.aborted {
        Outcome::Aborted
    } else if exec.timed_out {
        Outcome::TimedOut
    } else if exec.interrupted {
        Outcome::Interrupted
    } else if exec.wait_error.is_some() {
        Outcome::InternalError
    } else if exec.exit_code == Some(0) {
        Outcome::CompletedOk
    } else {
        Outcome::CompletedWithError
    }
}

/// Assemble the result of a command that was started
pub fn aggregate(
    command: String,
    pid: u32,
    exec: ExecOutcome,
    metrics: MonitorMetrics,
    timing: Timing,
) -> CommandResult {
    let outcome = classify(&exec, &metrics);

    let exit_code = match outcome {
        Outcome::Aborted | Outcome::TimedOut | Outcome::Interrupted => None,
        _ => exec.exit_code,
    };

    let mut stderr = exec.stderr;
    if let Some(error) = exec.wait_error {
        stderr = with_note(stderr, format!("Failed to wait for process: {}", error));
    }
    if exec.timed_out {
        let note = format!("Timeout occurred after {} seconds.", exec.timeout.as_secs_f64());
        stderr = with_note(stderr, note);
    }
    if exec.interrupted {
        stderr = with_note(stderr, INTERRUPTED_NOTE.to_string());
    }
    if metrics.aborted {
        let termination = metrics
            .termination
            .as_ref()
            .map(TerminationOutcome::as_str)
            .unwrap_or("unknown");
        stderr = with_note(
            stderr,
            format!("Aborted due to sustained resource usage (termination: {}).", termination),
        );
    }

    let aborted = metrics.aborted;
    CommandResult {
        command,
        stdout: exec.stdout,
        stderr,
        exit_code,
        timed_out: exec.timed_out,
        aborted,
        abort_reason: if aborted { metrics.abort_reason } else { None },
        time_to_abort: if aborted { metrics.time_to_abort } else { None },
        samples_collected: metrics.samples_collected,
        peak_cpu: metrics.peak_cpu,
        peak_mem: metrics.peak_mem,
        avg_cpu: metrics.avg_cpu,
        avg_mem: metrics.avg_mem,
        dry_run_breaches: metrics.dry_run_breaches,
        outcome,
        pid: Some(pid),
        started_at: timing.started_at,
        finished_at: timing.finished_at,
        elapsed: timing.elapsed,
    }
}

fn empty(command: String, stderr: String, outcome: Outcome, timing: Timing) -> CommandResult {
    CommandResult {
        command,
        stdout: String::new(),
        stderr,
        exit_code: None,
        timed_out: false,
        aborted: false,
        abort_reason: None,
        time_to_abort: None,
        samples_collected: 0,
        peak_cpu: 0.0,
        peak_mem: 0.0,
        avg_cpu: 0.0,
        avg_mem: 0.0,
        dry_run_breaches: 0,
        outcome,
        pid: None,
        started_at: timing.started_at,
        finished_at: timing.finished_at,
        elapsed: timing.elapsed,
    }
}

/// Result for a program that could not be started
pub fn spawn_failed(
    command: String,
    program: &str,
    error: &io::Error,
    timing: Timing,
) -> CommandResult {
    let stderr = match error.kind() {
        io::ErrorKind::NotFound => format!("Command not found: {}", program),
        io::ErrorKind::PermissionDenied => {
            format!("Command not executable: {} ({})", program, error)
        }
        _ => format!("Failed to start {}: {}", program, error),
    };
    empty(command, stderr, Outcome::SpawnFailed, timing)
}

/// Result for a command skipped because the governor is shutting down
pub fn not_started(command: String, timing: Timing) -> CommandResult {
    empty(command, INTERRUPTED_NOTE.to_string(), Outcome::Interrupted, timing)
}

/// Result for a failure inside the governor itself
pub fn internal_error(
    command: String,
    message: impl Into<String>,
    timing: Timing,
) -> CommandResult {
    empty(command, message.into(), Outcome::InternalError, timing)
}
