// src/runtime/coordinator.rs
//! Coordinator wiring executor, monitor, terminator and aggregator
//!
//! One command:
//!
//! ```text
//!            spawn (new session)
//!                  │
//!        ┌─────────┴──────────┐
//!        ▼                    ▼
//!   wait for exit,      sample every poll_interval
//!   timeout, shutdown         │
//!        │                    │
//!        ├─ stop monitor ────▶│ (monitor returns what it has)
//!        │                    │
//!        └─▶ Terminator ◀─────┘ sustained breach
//!                  │
//!              aggregate
//! ```
//!
//! Whichever of exit, timeout, shutdown or sustained breach fires first
//! decides how the command ends: the monitor is stopped before the executor
//! escalates, so it can never abort a process that already timed out.
//!
//! A batch fans out every command at once; each command runs in its own
//! tokio task, so a panic in one becomes an `InternalError` result instead of
//! taking the batch down. [`Coordinator::shutdown`] terminates every running
//! process group and skips commands that have not started yet.

use crate::observability;
use crate::runtime::aggregator::{self, CommandResult, Outcome, Timing};
use crate::runtime::probe::{ProbeFactory, ProcProbeFactory};
use crate::runtime::process_manager::{CommandSpec, ProcessManager, WaitControl};
use crate::runtime::resource_monitor::ResourceMonitor;
use crate::runtime::terminator::{NixSignalSender, SignalSender, Terminator};
use crate::utils::config::{GovernorConfig, MonitoringConfig};
use crate::utils::errors::GovernorError;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use ulid::Ulid;

fn timing(started_at: DateTime<Utc>, clock: Instant) -> Timing {
    Timing {
        started_at,
        finished_at: Utc::now(),
        elapsed: clock.elapsed(),
    }
}

/// Runs commands under resource governance
#[derive(Clone)]
pub struct Coordinator {
    config: Arc<MonitoringConfig>,
    manager: ProcessManager,
    terminator: Terminator,
    monitor: ResourceMonitor,
    probes: Arc<dyn ProbeFactory>,
    limiter: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("max_concurrency", &self.limiter.as_ref().map(|_| "bounded"))
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Coordinator {
    /// Coordinator signalling real process groups and sampling `/proc`
    pub fn new(config: Arc<MonitoringConfig>) -> Self {
        let sender: Arc<dyn SignalSender> = Arc::new(NixSignalSender);
        let terminator = Terminator::from_config(&config, sender);
        let monitor = ResourceMonitor::new(config.clone(), terminator.clone());

        Self {
            config,
            manager: ProcessManager::new(),
            terminator,
            monitor,
            probes: Arc::new(ProcProbeFactory),
            limiter: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Coordinator honouring the batch settings of a full configuration
    pub fn from_config(config: &GovernorConfig) -> Self {
        let coordinator = Self::new(Arc::new(config.monitoring.clone()));
        match config.runner.max_concurrency {
            Some(limit) => coordinator.with_max_concurrency(limit),
            None => coordinator,
        }
    }

    pub fn with_signal_sender(mut self, sender: Arc<dyn SignalSender>) -> Self {
        self.terminator = Terminator::from_config(&self.config, sender);
        self.monitor = ResourceMonitor::new(self.config.clone(), self.terminator.clone());
        self
    }

    pub fn with_probe_factory(mut self, probes: Arc<dyn ProbeFactory>) -> Self {
        self.probes = probes;
        self
    }

    /// Cap the number of commands running at once (minimum 1)
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.limiter = Some(Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Terminate every running command and refuse new ones.
    ///
    /// Running process groups go through the normal SIGTERM/SIGKILL
    /// escalation and report `Interrupted`. Shared by all clones.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            warn!("Shutdown requested, terminating running commands");
        }
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run one command. Never fails: every problem is reported in the result.
    pub async fn run_command(&self, argv: Vec<String>, timeout: Duration) -> CommandResult {
        let command = argv.join(" ");
        match CommandSpec::new(argv, timeout) {
            Ok(spec) => self.run_spec(spec).await,
            Err(e) => {
                warn!(%command, error = %e, "Rejected command");
                let now = timing(Utc::now(), Instant::now());
                let result = aggregator::internal_error(command, e.to_string(), now);
                observability::record_command(result.outcome, result.elapsed);
                result
            }
        }
    }

    /// Run a validated spec in its own task
    pub async fn run_spec(&self, spec: CommandSpec) -> CommandResult {
        let command = spec.display();

        let _permit = match &self.limiter {
            Some(limiter) => {
                let acquired = tokio::select! {
                    permit = limiter.clone().acquire_owned() => permit,
                    _ = self.shutdown.cancelled() => {
                        let now = timing(Utc::now(), Instant::now());
                        return aggregator::not_started(command, now);
                    }
                };
                match acquired {
                    Ok(permit) => Some(permit),
                    Err(e) => {
                        return aggregator::internal_error(
                            command,
                            format!("Concurrency limiter closed: {}", e),
                            timing(Utc::now(), Instant::now()),
                        )
                    }
                }
            }
            None => None,
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        let this = self.clone();

        match tokio::spawn(async move { this.govern(spec).await }).await {
            Ok(result) => result,
            Err(e) => {
                error!(%command, error = %e, "Command task failed");
                let result = aggregator::internal_error(
                    command,
                    format!("Command task failed: {}", e),
                    timing(started_at, clock),
                );
                observability::record_command(result.outcome, result.elapsed);
                result
            }
        }
    }

    /// Run every command concurrently with a shared timeout.
    ///
    /// Returns one result per input, in input order.
    pub async fn run_commands(
        &self,
        commands: Vec<Vec<String>>,
        timeout: Duration,
    ) -> Vec<CommandResult> {
        if commands.is_empty() {
            return Vec::new();
        }

        info!(
            command_count = commands.len(),
            timeout_secs = timeout.as_secs_f64(),
            "Starting a batch of commands"
        );

        let runs = commands
            .into_iter()
            .map(|argv| self.run_command(argv, timeout));
        let results = join_all(runs).await;

        info!(command_count = results.len(), "Finished running batch of commands");
        results
    }

    /// Run specs with individual timeouts concurrently, in input order
    pub async fn run_specs(&self, specs: Vec<CommandSpec>) -> Vec<CommandResult> {
        join_all(specs.into_iter().map(|spec| self.run_spec(spec))).await
    }

    async fn govern(&self, spec: CommandSpec) -> CommandResult {
        let run_id = Ulid::new();
        let command = spec.display();
        let span = info_span!("command", %run_id, command = %command);

        async move {
            let started_at = Utc::now();
            let clock = Instant::now();
            let timeout = spec.timeout();
            if self.shutdown.is_cancelled() {
                info!("Shutting down, command not started");
                return aggregator::not_started(command, timing(started_at, clock));
            }
            info!(timeout_secs = timeout.as_secs_f64(), "Starting command");

            let process = match self.manager.spawn(&spec) {
                Ok(process) => process,
                Err(GovernorError::SpawnFailed { program, source }) => {
                    error!(%program, error = %source, "Command could not be started");
                    let bounds = timing(started_at, clock);
                    let result = aggregator::spawn_failed(command, &program, &source, bounds);
                    observability::record_command(result.outcome, result.elapsed);
                    return result;
                }
                Err(e) => {
                    error!(error = %e, "Command could not be started");
                    let bounds = timing(started_at, clock);
                    let result = aggregator::internal_error(command, e.to_string(), bounds);
                    observability::record_command(result.outcome, result.elapsed);
                    return result;
                }
            };

            let pid = process.pid();
            let probe = self.probes.probe(pid);
            let control = WaitControl {
                monitor: CancellationToken::new(),
                shutdown: self.shutdown.clone(),
            };

            let (exec, metrics) = tokio::join!(
                process.wait(timeout, &self.terminator, &control),
                self.monitor.monitor(pid, probe, control.monitor.clone()),
            );

            let bounds = timing(started_at, clock);
            let result = aggregator::aggregate(command, pid, exec, metrics, bounds);

            match result.outcome {
                Outcome::CompletedOk => info!(
                    pid,
                    elapsed_secs = result.elapsed.as_secs_f64(),
                    samples = result.samples_collected,
                    "Command finished successfully"
                ),
                Outcome::CompletedWithError => warn!(
                    pid,
                    exit_code = ?result.exit_code,
                    elapsed_secs = result.elapsed.as_secs_f64(),
                    "Command finished with an error"
                ),
                Outcome::TimedOut => error!(
                    pid,
                    elapsed_secs = result.elapsed.as_secs_f64(),
                    "Command timed out"
                ),
                Outcome::Interrupted => warn!(pid, "Command interrupted by shutdown"),
                Outcome::Aborted => warn!(
                    pid,
                    peak_cpu = result.peak_cpu,
                    peak_mem = result.peak_mem,
                    samples = result.samples_collected,
                    "Command aborted for excessive resource usage"
                ),
                Outcome::SpawnFailed | Outcome::InternalError => {
                    error!(pid, stderr = %result.stderr, "Command failed")
                }
            }
            observability::record_command(result.outcome, result.elapsed);

            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::probe::ProcessProbe;
    use crate::runtime::resource_monitor::testing::ScriptedProbe;
    use crate::runtime::terminator::testing::{GroupBehavior, RecordingSender};

    /// Reports the same usage for every process
    struct FixedUsage {
        cpu: f64,
        mem: f64,
    }

    impl ProbeFactory for FixedUsage {
        fn probe(&self, _pid: u32) -> Box<dyn ProcessProbe> {
            Box::new(ScriptedProbe::constant(self.cpu, self.mem))
        }
    }

    fn fast_config(overrides: impl FnOnce(&mut MonitoringConfig)) -> Arc<MonitoringConfig> {
        let mut config = MonitoringConfig {
            cpu_limit: 0.5,
            mem_limit: 0.5,
            breach_window: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
            kill_grace: Duration::from_secs(1),
            ..Default::default()
        };
        overrides(&mut config);
        Arc::new(config)
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_abort_disabled_never_signals() {
        let sender = Arc::new(RecordingSender::new(GroupBehavior::DiesOnTerm));
        let coordinator = Coordinator::new(fast_config(|c| c.abort_enabled = false))
            .with_signal_sender(sender.clone())
            .with_probe_factory(Arc::new(FixedUsage { cpu: 4.0, mem: 0.9 }));

        let result = coordinator
            .run_command(argv(&["sleep", "0.5"]), Duration::from_secs(5))
            .await;

        assert_eq!(result.outcome, Outcome::CompletedOk);
        assert!(!result.aborted);
        assert_eq!(result.samples_collected, 0);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_never_signals() {
        let sender = Arc::new(RecordingSender::new(GroupBehavior::DiesOnTerm));
        let coordinator = Coordinator::new(fast_config(|c| c.abort_dry_run = true))
            .with_signal_sender(sender.clone())
            .with_probe_factory(Arc::new(FixedUsage { cpu: 4.0, mem: 0.1 }));

        let result = coordinator
            .run_command(argv(&["sleep", "1"]), Duration::from_secs(5))
            .await;

        assert_eq!(result.outcome, Outcome::CompletedOk);
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.aborted);
        assert!(result.dry_run_breaches >= 1);
        assert!(result.samples_collected >= 4);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_sustained_usage_aborts_real_process() {
        let coordinator = Coordinator::new(fast_config(|_| {}))
            .with_probe_factory(Arc::new(FixedUsage { cpu: 2.0, mem: 0.1 }));

        let result = coordinator
            .run_command(argv(&["sleep", "10"]), Duration::from_secs(5))
            .await;

        assert_eq!(result.outcome, Outcome::Aborted);
        assert!(result.aborted);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.abort_reason.as_deref(), Some("resource_limit"));
        assert!(result.time_to_abort.unwrap() >= Duration::from_millis(200));
        assert!(result.samples_collected >= 2);
        assert!(result.elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_invalid_command_becomes_result() {
        let coordinator = Coordinator::new(fast_config(|_| {}));

        let result = coordinator.run_command(Vec::new(), Duration::from_secs(1)).await;
        assert_eq!(result.outcome, Outcome::InternalError);
        assert_eq!(result.exit_code, None);
        assert!(result.stderr.contains("argv is empty"));

        let result = coordinator.run_command(argv(&["true"]), Duration::ZERO).await;
        assert_eq!(result.outcome, Outcome::InternalError);
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let coordinator = Coordinator::new(fast_config(|c| c.abort_enabled = false));
        let results = coordinator
            .run_commands(
                vec![
                    argv(&["sh", "-c", "sleep 0.3; echo first"]),
                    argv(&["/no/such/tool"]),
                    argv(&["sh", "-c", "echo third; exit 2"]),
                ],
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].stdout, "first");
        assert_eq!(results[0].outcome, Outcome::CompletedOk);
        assert_eq!(results[1].outcome, Outcome::SpawnFailed);
        assert!(results[1].stderr.contains("/no/such/tool"));
        assert_eq!(results[2].stdout, "third");
        assert_eq!(results[2].exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let coordinator = Coordinator::new(fast_config(|_| {}));
        assert!(coordinator.run_commands(Vec::new(), Duration::from_secs(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let coordinator = Coordinator::new(fast_config(|c| c.abort_enabled = false))
            .with_max_concurrency(1);

        let started = Instant::now();
        let results = coordinator
            .run_commands(
                vec![argv(&["sleep", "0.3"]), argv(&["sleep", "0.3"])],
                Duration::from_secs(5),
            )
            .await;

        assert!(results.iter().all(CommandResult::succeeded));
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_timeout_decides_when_it_fires_before_breach_window() {
        let coordinator = Coordinator::new(fast_config(|c| {
            c.breach_window = Duration::from_secs(1);
            c.kill_grace = Duration::from_secs(2);
        }))
        .with_probe_factory(Arc::new(FixedUsage { cpu: 5.0, mem: 0.1 }));

        let result = coordinator
            .run_command(
                argv(&["sh", "-c", "trap '' TERM; sleep 4"]),
                Duration::from_millis(700),
            )
            .await;

        assert_eq!(result.outcome, Outcome::TimedOut);
        assert!(result.timed_out);
        assert!(!result.aborted);
        assert_eq!(result.abort_reason, None);
        assert_eq!(result.time_to_abort, None);
        assert!(result.samples_collected >= 5);
        assert!(result.stderr.contains("Timeout occurred after 0.7 seconds."));
        assert!(!result.stderr.contains("Aborted"));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_running_and_queued_commands() {
        let coordinator = Coordinator::new(fast_config(|c| c.abort_enabled = false))
            .with_max_concurrency(1);
        let handle = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            handle.shutdown();
        });

        let started = Instant::now();
        let results = coordinator
            .run_commands(
                vec![argv(&["sleep", "30"]), argv(&["sleep", "30"])],
                Duration::from_secs(60),
            )
            .await;

        assert!(coordinator.is_shutting_down());
        assert_eq!(results[0].outcome, Outcome::Interrupted);
        assert!(results[0].pid.is_some());
        assert_eq!(results[0].exit_code, None);
        assert_eq!(results[1].outcome, Outcome::Interrupted);
        assert_eq!(results[1].pid, None);
        assert!(started.elapsed() < Duration::from_secs(4));

        let late = coordinator
            .run_command(argv(&["true"]), Duration::from_secs(1))
            .await;
        assert_eq!(late.outcome, Outcome::Interrupted);
    }
}
