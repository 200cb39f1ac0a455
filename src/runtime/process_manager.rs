// src/runtime/process_manager.rs
//! Process manager for spawning and waiting on governed commands
//!
//! Each command is started as the leader of a new session (`setsid`), which
//! also makes it the leader of a new process group. Signalling that group
//! reaches every descendant, including ones forked by shell pipelines.
//!
//! stdout/stderr are drained by background tasks from the moment of spawn,
//! so a chatty tool never stalls on a full pipe while we wait for it. The
//! readers append to shared buffers, so output read before a descendant
//! left a pipe open is kept when reading is cut short.

use crate::runtime::terminator::{TerminationOutcome, TerminationReason, Terminator};
use crate::utils::errors::{GovernorError, Result};
use parking_lot::Mutex;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to keep reading output after the process is gone.
///
/// A descendant that escaped the process group can hold the pipes open
/// indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Extra time allowed for reaping after a timeout escalation
const REAP_SLACK: Duration = Duration::from_secs(2);

/// A command to run under governance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandSpec {
    /// Validate and build a spec. `argv` must be non-empty and `timeout`
    /// positive.
    pub fn new<I, S>(argv: I, timeout: Duration) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        match argv.first() {
            None => return Err(GovernorError::InvalidCommand("argv is empty".to_string())),
            Some(program) if program.is_empty() => {
                return Err(GovernorError::InvalidCommand("program name is empty".to_string()))
            }
            Some(_) => {}
        }
        if timeout.is_zero() {
            return Err(GovernorError::InvalidCommand("timeout must be positive".to_string()));
        }
        Ok(Self { argv, timeout })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Human-readable command line
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// What the executor observed for one process
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    /// Exit code, absent when killed by a signal
    pub exit_code: Option<i32>,

    /// Terminating signal, if any
    pub signal: Option<i32>,

    /// The overall timeout fired
    pub timed_out: bool,

    /// The governor shut down before the process exited
    pub interrupted: bool,

    /// Timeout the command ran under
    pub timeout: Duration,

    pub stdout: String,
    pub stderr: String,

    /// Escalation result on the timeout and shutdown paths
    pub termination: Option<TerminationOutcome>,

    /// Waiting on the child failed
    pub wait_error: Option<String>,
}

/// Tokens tying a wait to the rest of the command's lifecycle
#[derive(Debug, Clone, Default)]
pub struct WaitControl {
    /// Cancelled once the wait has decided how the process ends, before any
    /// escalation starts
    pub monitor: CancellationToken,

    /// Cancelled by the owner to stop the process early
    pub shutdown: CancellationToken,
}

/// How the wait for the child ended
enum Ending {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Interrupted,
}

async fn read_pipe<R>(pipe: Option<R>, buf: Arc<Mutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buf.lock().extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

/// One output stream, filled by a background reader
#[derive(Debug)]
struct OutputPipe {
    buf: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl OutputPipe {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let reader = tokio::spawn(read_pipe(pipe, buf.clone()));
        Self { buf, reader }
    }

    /// Wait up to `OUTPUT_DRAIN_TIMEOUT` for EOF and return everything read.
    ///
    /// The flag is set when the pipe was still open and reading stopped early.
    async fn collect(self, stream: &'static str) -> (String, bool) {
        let Self { buf, reader } = self;
        let abort = reader.abort_handle();

        let cut_short = match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                warn!(stream, error = %e, "Output reader task failed");
                false
            }
            Err(_) => {
                abort.abort();
                warn!(stream, "Output still open after process exit, keeping what was read");
                true
            }
        };

        let bytes = std::mem::take(&mut *buf.lock());
        (String::from_utf8_lossy(&bytes).trim().to_string(), cut_short)
    }
}

fn with_note(text: String, note: &str) -> String {
    if text.is_empty() {
        note.to_string()
    } else {
        format!("{}\n{}", text, note)
    }
}

/// A running governed process
#[derive(Debug)]
pub struct SpawnedProcess {
    child: Child,
    pid: u32,
    stdout: OutputPipe,
    stderr: OutputPipe,
}

impl SpawnedProcess {
    /// Pid of the program, also its process group id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for natural exit, `timeout`, or `control.shutdown`, whichever
    /// comes first.
    ///
    /// `control.monitor` is cancelled as soon as the ending is known, so
    /// nothing else can claim the process once the timeout has fired. On
    /// timeout or shutdown the process group is escalated through
    /// `terminator` while the child is reaped concurrently, so a prompt exit
    /// on SIGTERM ends the grace period early.
    pub async fn wait(
        mut self,
        timeout: Duration,
        terminator: &Terminator,
        control: &WaitControl,
    ) -> ExecOutcome {
        let pid = self.pid;
        let mut termination = None;
        let mut wait_error = None;

        let ending = tokio::select! {
            status = self.child.wait() => Ending::Exited(status),
            _ = tokio::time::sleep(timeout) => Ending::TimedOut,
            _ = control.shutdown.cancelled() => Ending::Interrupted,
        };
        control.monitor.cancel();

        let timed_out = matches!(ending, Ending::TimedOut);
        let interrupted = matches!(ending, Ending::Interrupted);

        let status = match ending {
            Ending::Exited(Ok(status)) => Some(status),
            Ending::Exited(Err(e)) => {
                warn!(pid, error = %e, "Failed to wait for process");
                wait_error = Some(e.to_string());
                None
            }
            Ending::TimedOut | Ending::Interrupted => {
                let reason = if timed_out {
                    warn!(pid, timeout_secs = timeout.as_secs_f64(), "Command timed out");
                    TerminationReason::Timeout
                } else {
                    warn!(pid, "Shutting down, terminating command");
                    TerminationReason::Shutdown
                };

                let reap_deadline = terminator.grace() + REAP_SLACK;
                let (outcome, reaped) = tokio::join!(
                    terminator.terminate(pid, reason),
                    tokio::time::timeout(reap_deadline, self.child.wait()),
                );
                termination = Some(outcome);

                match reaped {
                    Ok(Ok(status)) => Some(status),
                    Ok(Err(e)) => {
                        wait_error = Some(e.to_string());
                        None
                    }
                    Err(_) => {
                        warn!(
                            pid,
                            "Process not reaped after escalation, leaving it to kill_on_drop"
                        );
                        None
                    }
                }
            }
        };

        let ((stdout, stdout_cut), (mut stderr, stderr_cut)) = tokio::join!(
            self.stdout.collect("stdout"),
            self.stderr.collect("stderr"),
        );
        for (stream, cut_short) in [("stdout", stdout_cut), ("stderr", stderr_cut)] {
            if cut_short {
                let note = format!(
                    "Output capture stopped: {} was still held open by a background process.",
                    stream
                );
                stderr = with_note(stderr, &note);
            }
        }

        let exit_code = status.and_then(|s| s.code());
        let signal = status.and_then(|s| s.signal());

        match (exit_code, signal) {
            (Some(0), _) => debug!(pid, "Process exited successfully"),
            (Some(code), _) => info!(pid, code, "Process exited with non-zero status"),
            (None, Some(signal)) => info!(pid, signal, "Process killed by signal"),
            (None, None) => {}
        }

        ExecOutcome {
            exit_code,
            signal,
            timed_out,
            interrupted,
            timeout,
            stdout,
            stderr,
            termination,
            wait_error,
        }
    }
}

/// Process manager for spawning governed commands
#[derive(Debug, Clone, Default)]
pub struct ProcessManager;

impl ProcessManager {
    /// Create a new process manager
    pub fn new() -> Self {
        Self
    }

    /// Spawn `spec` in a new session with piped output
    pub fn spawn(&self, spec: &CommandSpec) -> Result<SpawnedProcess> {
        let program = spec.program();
        debug!(program, args = ?&spec.argv()[1..], "Spawning process");

        let mut command = Command::new(program);
        command
            .args(&spec.argv()[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // SAFETY: setsid is async-signal-safe and touches no parent state
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(io::Error::from)
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| GovernorError::spawn_failed(program, e))?;

        let pid = child.id().ok_or_else(|| {
            GovernorError::Wait(io::Error::new(
                io::ErrorKind::Other,
                "process exited before its pid could be read",
            ))
        })?;

        let stdout = OutputPipe::spawn(child.stdout.take());
        let stderr = OutputPipe::spawn(child.stderr.take());

        debug!(pid, "Process spawned in its own process group");

        Ok(SpawnedProcess {
            child,
            pid,
            stdout,
            stderr,
        })
    }

    /// Spawn and wait without resource monitoring
    pub async fn execute(
        &self,
        spec: &CommandSpec,
        terminator: &Terminator,
    ) -> Result<ExecOutcome> {
        let process = self.spawn(spec)?;
        Ok(process
            .wait(spec.timeout(), terminator, &WaitControl::default())
            .await)
    }

    /// Check if a process exists
    pub fn is_running(&self, pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}
