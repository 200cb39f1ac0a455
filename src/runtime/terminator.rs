// src/runtime/terminator.rs
//! Termination escalation for process groups
//!
//! Every governed command runs in its own session, so its process group id
//! equals the pid of the spawned program and reaches all of its descendants
//! (shell pipelines, helper processes). Termination is:
//!
//! 1. SIGTERM to the whole group
//! 2. Poll liveness for up to `kill_grace`
//! 3. SIGKILL to the whole group if anything survived
//!
//! A group that is already gone at any step counts as success, since
//! termination routinely races with the process's own exit.

use crate::observability;
use crate::utils::config::{MonitoringConfig, MAX_KILL_GRACE};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgid, getpgrp, Pid};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Interval between liveness checks during the grace period
const LIVENESS_POLL: Duration = Duration::from_millis(50);

/// Why a process group is being terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Sustained breach of the CPU or memory limit
    ResourceLimit,
    /// Overall command timeout expired
    Timeout,
    /// The governor itself is shutting down
    Shutdown,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::ResourceLimit => "resource_limit",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a termination request actually did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// Dry-run mode, nothing was signalled
    DryRun,
    /// Group had exited before the first signal
    AlreadyExited,
    /// Group exited within the grace period after SIGTERM
    Graceful,
    /// SIGKILL was required
    Forced,
    /// Signal delivery failed for a reason other than the group being gone
    Failed(String),
}

impl TerminationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationOutcome::DryRun => "dry_run",
            TerminationOutcome::AlreadyExited => "already_exited",
            TerminationOutcome::Graceful => "graceful",
            TerminationOutcome::Forced => "forced",
            TerminationOutcome::Failed(_) => "failed",
        }
    }

    /// True if at least one signal was delivered
    pub fn signalled(&self) -> bool {
        matches!(self, TerminationOutcome::Graceful | TerminationOutcome::Forced)
    }
}

/// Signal delivery primitive.
///
/// `signal == None` probes for existence without delivering anything, the
/// same convention as `kill(2)` with signal 0.
pub trait SignalSender: Send + Sync {
    fn signal_group(&self, pgid: Pid, signal: Option<Signal>) -> nix::Result<()>;

    fn process_group(&self, pid: Pid) -> nix::Result<Pid>;
}

/// Production sender using `killpg(2)` and `getpgid(2)`
#[derive(Debug, Clone, Copy, Default)]
pub struct NixSignalSender;

impl SignalSender for NixSignalSender {
    fn signal_group(&self, pgid: Pid, signal: Option<Signal>) -> nix::Result<()> {
        killpg(pgid, signal)
    }

    fn process_group(&self, pid: Pid) -> nix::Result<Pid> {
        getpgid(Some(pid))
    }
}

/// Escalates from SIGTERM to SIGKILL against a process group
#[derive(Clone)]
pub struct Terminator {
    grace: Duration,
    dry_run: bool,
    sender: Arc<dyn SignalSender>,
}

impl fmt::Debug for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminator")
            .field("grace", &self.grace)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl Terminator {
    pub fn new(grace: Duration, dry_run: bool, sender: Arc<dyn SignalSender>) -> Self {
        Self {
            grace,
            dry_run,
            sender,
        }
    }

    pub fn from_config(config: &MonitoringConfig, sender: Arc<dyn SignalSender>) -> Self {
        Self::new(config.kill_grace, config.abort_dry_run, sender)
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Grace period, bounded so deadlines can always be computed
    pub fn grace(&self) -> Duration {
        self.grace.min(MAX_KILL_GRACE)
    }

    /// Resolve the group to signal for `pid`.
    ///
    /// Governed processes lead their own session, so a reaped leader still
    /// leaves `pgid == pid` valid for surviving descendants. A pid sharing our
    /// own group is never signalled as a group.
    fn resolve_group(&self, pid: Pid) -> Option<Pid> {
        let pgid = match self.sender.process_group(pid) {
            Ok(pgid) => pgid,
            Err(Errno::ESRCH) => pid,
            Err(e) => {
                debug!(pid = pid.as_raw(), error = %e, "getpgid failed, assuming session leader");
                pid
            }
        };

        if pgid == getpgrp() {
            warn!(
                pid = pid.as_raw(),
                pgid = pgid.as_raw(),
                "Refusing to signal the governor's own process group"
            );
            return None;
        }
        Some(pgid)
    }

    fn group_alive(&self, pgid: Pid) -> bool {
        match self.sender.signal_group(pgid, None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            // EPERM still proves existence
            Err(_) => true,
        }
    }

    /// Terminate the process group led by `pid`.
    ///
    /// Never fails; problems are reported through [`TerminationOutcome`].
    /// In dry-run mode, resource-limit terminations are only logged. Timeouts
    /// are always enforced.
    pub async fn terminate(&self, pid: u32, reason: TerminationReason) -> TerminationOutcome {
        let outcome = self.escalate(pid, reason).await;
        observability::record_termination(&outcome);
        outcome
    }

    async fn escalate(&self, pid: u32, reason: TerminationReason) -> TerminationOutcome {
        let pid = Pid::from_raw(pid as i32);

        if self.dry_run && reason == TerminationReason::ResourceLimit {
            warn!(
                pid = pid.as_raw(),
                pgid = pid.as_raw(),
                %reason,
                "Dry run: would terminate process group"
            );
            return TerminationOutcome::DryRun;
        }

        let Some(pgid) = self.resolve_group(pid) else {
            return TerminationOutcome::Failed(
                "target shares the governor's process group".to_string(),
            );
        };

        info!(
            pid = pid.as_raw(),
            pgid = pgid.as_raw(),
            %reason,
            "Sending SIGTERM to process group"
        );
        match self.sender.signal_group(pgid, Some(Signal::SIGTERM)) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                debug!(pgid = pgid.as_raw(), "Process group already gone");
                return TerminationOutcome::AlreadyExited;
            }
            Err(e) => {
                warn!(pgid = pgid.as_raw(), error = %e, "Failed to send SIGTERM");
                return TerminationOutcome::Failed(format!("SIGTERM: {}", e));
            }
        }

        let deadline = Instant::now() + self.grace();
        loop {
            if !self.group_alive(pgid) {
                debug!(pgid = pgid.as_raw(), "Process group exited after SIGTERM");
                return TerminationOutcome::Graceful;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(LIVENESS_POLL.min(deadline - now)).await;
        }

        warn!(
            pgid = pgid.as_raw(),
            grace_secs = self.grace().as_secs_f64(),
            "Process group survived grace period, sending SIGKILL"
        );
        match self.sender.signal_group(pgid, Some(Signal::SIGKILL)) {
            Ok(()) => TerminationOutcome::Forced,
            Err(Errno::ESRCH) => TerminationOutcome::Graceful,
            Err(e) => {
                warn!(pgid = pgid.as_raw(), error = %e, "Failed to send SIGKILL");
                TerminationOutcome::Failed(format!("SIGKILL: {}", e))
            }
        }
    }
}
