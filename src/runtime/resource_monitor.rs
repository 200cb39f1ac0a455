// src/runtime/resource_monitor.rs
//! Resource monitor for a single governed process
//!
//! Runs next to the process wait and samples CPU/memory every
//! `poll_interval`:
//!
//! ```text
//! sample ─▶ RunningStats (peak / mean)
//!        └▶ Ema (cpu, mem) ─▶ BreachDetector ─▶ WithinLimits
//!                                             ├▶ Breaching { since }
//!                                             └▶ Sustained { elapsed } ─▶ Terminator
//! ```
//!
//! A single sample under both limits clears the breach timer. There is no
//! partial credit for time already spent over the limit, so a spike shorter
//! than the breach window is never punished.

use crate::runtime::probe::{ProbeError, ProcessProbe, ResourceSample};
use crate::runtime::terminator::{TerminationOutcome, TerminationReason, Terminator};
use crate::utils::config::MonitoringConfig;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Abort reason reported for sustained resource breaches
pub const ABORT_REASON_RESOURCE_LIMIT: &str = "resource_limit";

/// Exponential moving average
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// Fold in a sample and return the smoothed value
    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Running peak and arithmetic mean of raw samples
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    peak_cpu: f64,
    peak_mem: f64,
    sum_cpu: f64,
    sum_mem: f64,
}

impl RunningStats {
    pub fn record(&mut self, sample: ResourceSample) {
        self.count += 1;
        self.peak_cpu = self.peak_cpu.max(sample.cpu);
        self.peak_mem = self.peak_mem.max(sample.mem);
        self.sum_cpu += sample.cpu;
        self.sum_mem += sample.mem;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn peak_cpu(&self) -> f64 {
        self.peak_cpu
    }

    pub fn peak_mem(&self) -> f64 {
        self.peak_mem
    }

    // Means are clamped to the peak to absorb float rounding.
    pub fn avg_cpu(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.sum_cpu / self.count as f64).min(self.peak_cpu)
    }

    pub fn avg_mem(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.sum_mem / self.count as f64).min(self.peak_mem)
    }
}

/// Result of feeding one sample to the [`BreachDetector`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreachDecision {
    /// Smoothed usage is under both limits
    WithinLimits,
    /// Over a limit, but not for the full window yet
    Breaching { since: Instant },
    /// Over a limit for at least the breach window
    Sustained { elapsed: Duration },
}

/// EMA smoothing plus the breach timer
#[derive(Debug, Clone)]
pub struct BreachDetector {
    cpu_limit: f64,
    mem_limit: f64,
    window: Duration,
    cpu: Ema,
    mem: Ema,
    breach_start: Option<Instant>,
}

impl BreachDetector {
    pub fn new(cpu_limit: f64, mem_limit: f64, window: Duration, alpha: f64) -> Self {
        Self {
            cpu_limit,
            mem_limit,
            window,
            cpu: Ema::new(alpha),
            mem: Ema::new(alpha),
            breach_start: None,
        }
    }

    pub fn from_config(config: &MonitoringConfig) -> Self {
        Self::new(
            config.cpu_limit,
            config.mem_limit,
            config.breach_window,
            config.effective_alpha(),
        )
    }

    pub fn observe(&mut self, sample: ResourceSample, now: Instant) -> BreachDecision {
        let ema_cpu = self.cpu.update(sample.cpu);
        let ema_mem = self.mem.update(sample.mem);
        let over_limit = ema_cpu >= self.cpu_limit || ema_mem >= self.mem_limit;

        if !over_limit {
            self.breach_start = None;
            return BreachDecision::WithinLimits;
        }

        let since = *self.breach_start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(since);
        if elapsed >= self.window {
            BreachDecision::Sustained { elapsed }
        } else {
            BreachDecision::Breaching { since }
        }
    }

    /// Restart the breach timer, smoothing state is kept
    pub fn reset(&mut self) {
        self.breach_start = None;
    }

    pub fn breach_start(&self) -> Option<Instant> {
        self.breach_start
    }

    /// Current smoothed (cpu, mem)
    pub fn smoothed(&self) -> (Option<f64>, Option<f64>) {
        (self.cpu.value(), self.mem.value())
    }
}

/// Monitor sub-state while a command is running
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorState {
    Disabled,
    Sampling,
    BreachDetected { since: Instant },
    Terminating,
    Stopped,
}

/// Everything the monitor learned about one command
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorMetrics {
    pub samples_collected: u64,
    pub peak_cpu: f64,
    pub peak_mem: f64,
    pub avg_cpu: f64,
    pub avg_mem: f64,
    pub aborted: bool,
    pub abort_reason: Option<String>,
    #[serde(skip)]
    pub time_to_abort: Option<Duration>,
    /// Breaches that would have aborted the process in dry-run mode
    pub dry_run_breaches: u32,
    /// Escalation result when the monitor terminated the process
    pub termination: Option<TerminationOutcome>,
}

impl MonitorMetrics {
    fn from_stats(stats: &RunningStats) -> Self {
        Self {
            samples_collected: stats.count(),
            peak_cpu: stats.peak_cpu(),
            peak_mem: stats.peak_mem(),
            avg_cpu: stats.avg_cpu(),
            avg_mem: stats.avg_mem(),
            ..Default::default()
        }
    }
}

/// Samples one process and aborts it on a sustained breach
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    config: Arc<MonitoringConfig>,
    terminator: Terminator,
}

impl ResourceMonitor {
    pub fn new(config: Arc<MonitoringConfig>, terminator: Terminator) -> Self {
        Self { config, terminator }
    }

    /// Monitor `pid` until it exits, is aborted, sampling fails, or `cancel`
    /// fires.
    ///
    /// Cancellation is only observed between samples and returns everything
    /// collected so far; it never signals the process.
    pub async fn monitor(
        &self,
        pid: u32,
        mut probe: Box<dyn ProcessProbe>,
        cancel: CancellationToken,
    ) -> MonitorMetrics {
        if !self.config.sampling_enabled() {
            trace!(pid, state = ?MonitorState::Disabled, "Resource monitoring disabled");
            return MonitorMetrics::default();
        }

        let mut stats = RunningStats::default();
        let mut detector = BreachDetector::from_config(&self.config);
        let mut state = MonitorState::Sampling;
        let mut dry_run_breaches = 0u32;
        let mut abort: Option<(Duration, TerminationOutcome)> = None;

        debug!(
            pid,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Resource monitor started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    trace!(pid, "Monitor cancelled");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let sample = match probe.sample() {
                Ok(sample) => sample,
                Err(ProbeError::Gone) => {
                    trace!(pid, "Process no longer observable");
                    break;
                }
                Err(e) => {
                    debug!(pid, error = %e, "Sampling failed, stopping monitor");
                    break;
                }
            };

            let now = Instant::now();
            stats.record(sample);

            let next = match detector.observe(sample, now) {
                BreachDecision::WithinLimits => MonitorState::Sampling,
                BreachDecision::Breaching { since } => MonitorState::BreachDetected { since },
                BreachDecision::Sustained { elapsed } => {
                    let (ema_cpu, ema_mem) = detector.smoothed();
                    warn!(
                        pid,
                        cpu = sample.cpu,
                        mem = sample.mem,
                        ema_cpu = ema_cpu.unwrap_or_default(),
                        ema_mem = ema_mem.unwrap_or_default(),
                        breach_secs = elapsed.as_secs_f64(),
                        "Sustained resource breach"
                    );

                    state = MonitorState::Terminating;
                    let outcome = self
                        .terminator
                        .terminate(pid, TerminationReason::ResourceLimit)
                        .await;

                    if outcome == TerminationOutcome::DryRun {
                        dry_run_breaches += 1;
                        detector.reset();
                        MonitorState::Sampling
                    } else {
                        abort = Some((elapsed, outcome));
                        break;
                    }
                }
            };

            if next != state {
                trace!(pid, from = ?state, to = ?next, "Monitor state change");
                state = next;
            }
        }

        trace!(pid, from = ?state, to = ?MonitorState::Stopped, "Monitor state change");

        let mut metrics = MonitorMetrics::from_stats(&stats);
        metrics.dry_run_breaches = dry_run_breaches;
        if let Some((time_to_abort, outcome)) = abort {
            info!(
                pid,
                samples = metrics.samples_collected,
                time_to_abort_secs = time_to_abort.as_secs_f64(),
                termination = outcome.as_str(),
                "Process aborted for resource usage"
            );
            metrics.aborted = true;
            metrics.abort_reason = Some(ABORT_REASON_RESOURCE_LIMIT.to_string());
            metrics.time_to_abort = Some(time_to_abort);
            metrics.termination = Some(outcome);
        }
        metrics
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProbe;
    use super::*;
    use crate::runtime::terminator::testing::{GroupBehavior, RecordingSender};
    use crate::utils::config::SmoothingMethod;
    use nix::sys::signal::Signal;
    use proptest::prelude::*;
    use std::sync::atomic::Ordering;

    const PID: u32 = 4_100_000;

    fn config(overrides: impl FnOnce(&mut MonitoringConfig)) -> Arc<MonitoringConfig> {
        let mut config = MonitoringConfig {
            cpu_limit: 0.5,
            mem_limit: 0.5,
            breach_window: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            kill_grace: Duration::from_secs(1),
            ..Default::default()
        };
        overrides(&mut config);
        Arc::new(config)
    }

    fn monitor(config: Arc<MonitoringConfig>) -> (ResourceMonitor, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::new(GroupBehavior::DiesOnTerm));
        let terminator = Terminator::from_config(&config, sender.clone());
        (ResourceMonitor::new(config, terminator), sender)
    }

    #[test]
    fn test_ema_first_sample_is_raw() {
        let mut ema = Ema::new(0.3);
        assert_eq!(ema.update(0.9), 0.9);
        let next = ema.update(0.1);
        assert!((next - (0.3 * 0.1 + 0.7 * 0.9)).abs() < 1e-12);
    }

    #[test]
    fn test_running_stats() {
        let mut stats = RunningStats::default();
        assert_eq!(stats.avg_cpu(), 0.0);

        stats.record(ResourceSample::new(0.2, 0.1));
        stats.record(ResourceSample::new(0.6, 0.3));
        assert_eq!(stats.count(), 2);
        assert_eq!(stats.peak_cpu(), 0.6);
        assert_eq!(stats.peak_mem(), 0.3);
        assert!((stats.avg_cpu() - 0.4).abs() < 1e-12);
        assert!((stats.avg_mem() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_detector_sustained_breach() {
        let mut detector = BreachDetector::new(0.5, 0.9, Duration::from_secs(2), 1.0);
        let t0 = Instant::now();
        let hot = ResourceSample::new(0.8, 0.1);

        assert_eq!(detector.observe(hot, t0), BreachDecision::Breaching { since: t0 });
        assert_eq!(
            detector.observe(hot, t0 + Duration::from_secs(1)),
            BreachDecision::Breaching { since: t0 }
        );
        assert_eq!(
            detector.observe(hot, t0 + Duration::from_secs(2)),
            BreachDecision::Sustained { elapsed: Duration::from_secs(2) }
        );
    }

    #[test]
    fn test_detector_single_dip_resets_timer() {
        let mut detector = BreachDetector::new(0.5, 0.9, Duration::from_secs(2), 1.0);
        let t0 = Instant::now();
        let at = |s: u64| t0 + Duration::from_secs(s);
        let hot = ResourceSample::new(0.8, 0.1);
        let cool = ResourceSample::new(0.1, 0.1);

        detector.observe(hot, at(0));
        detector.observe(hot, at(1));
        assert_eq!(detector.observe(cool, at(2)), BreachDecision::WithinLimits);
        assert_eq!(detector.breach_start(), None);
        assert_eq!(detector.observe(hot, at(3)), BreachDecision::Breaching { since: at(3) });
        assert_eq!(detector.observe(hot, at(4)), BreachDecision::Breaching { since: at(3) });
    }

    #[test]
    fn test_detector_memory_breach() {
        let mut detector = BreachDetector::new(0.9, 0.5, Duration::from_secs(1), 0.3);
        let t0 = Instant::now();
        let bloated = ResourceSample::new(0.0, 0.7);

        detector.observe(bloated, t0);
        assert!(matches!(
            detector.observe(bloated, t0 + Duration::from_secs(1)),
            BreachDecision::Sustained { .. }
        ));
    }

    #[test]
    fn test_detector_smoothing_holds_breach_through_short_dip() {
        let mut detector = BreachDetector::new(0.5, 0.9, Duration::from_secs(2), 0.3);
        let t0 = Instant::now();

        detector.observe(ResourceSample::new(0.9, 0.0), t0);
        // 0.3 * 0.1 + 0.7 * 0.9 = 0.66, still over
        let decision = detector.observe(ResourceSample::new(0.1, 0.0), t0 + Duration::from_secs(1));
        assert_eq!(decision, BreachDecision::Breaching { since: t0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_monitor_never_samples() {
        let (monitor, sender) = monitor(config(|c| c.abort_enabled = false));
        let probe = ScriptedProbe::constant(5.0, 0.9);
        let calls = probe.calls();

        let metrics = monitor.monitor(PID, Box::new(probe), CancellationToken::new()).await;

        assert_eq!(metrics, MonitorMetrics::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_breach_aborts() {
        let (monitor, sender) = monitor(config(|_| {}));
        let probe = ScriptedProbe::constant(0.95, 0.1);

        let started = Instant::now();
        let metrics = monitor.monitor(PID, Box::new(probe), CancellationToken::new()).await;

        assert!(metrics.aborted);
        assert_eq!(metrics.abort_reason.as_deref(), Some(ABORT_REASON_RESOURCE_LIMIT));
        assert_eq!(metrics.time_to_abort, Some(Duration::from_secs(2)));
        assert_eq!(metrics.samples_collected, 3);
        assert_eq!(metrics.termination, Some(TerminationOutcome::Graceful));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(sender.sent(), vec![(PID as i32, Signal::SIGTERM)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spike_shorter_than_window_is_ignored() {
        let (monitor, sender) = monitor(config(|c| c.smoothing = SmoothingMethod::None));
        let probe = ScriptedProbe::new([
            (0.9, 0.1),
            (0.9, 0.1),
            (0.1, 0.1),
            (0.9, 0.1),
            (0.9, 0.1),
            (0.1, 0.1),
        ]);

        let metrics = monitor.monitor(PID, Box::new(probe), CancellationToken::new()).await;

        assert!(!metrics.aborted);
        assert_eq!(metrics.abort_reason, None);
        assert_eq!(metrics.samples_collected, 6);
        assert_eq!(metrics.peak_cpu, 0.9);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_keeps_sampling() {
        let (monitor, sender) = monitor(config(|c| {
            c.abort_enabled = false;
            c.abort_dry_run = true;
        }));
        let probe = ScriptedProbe::new(std::iter::repeat((0.95, 0.1)).take(7));

        let metrics = monitor.monitor(PID, Box::new(probe), CancellationToken::new()).await;

        assert!(!metrics.aborted);
        assert_eq!(metrics.abort_reason, None);
        assert_eq!(metrics.time_to_abort, None);
        assert_eq!(metrics.samples_collected, 7);
        // breach windows close at samples 3 and 6
        assert_eq!(metrics.dry_run_breaches, 2);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_keeps_collected_samples() {
        let (monitor, sender) = monitor(config(|c| c.breach_window = Duration::from_secs(60)));
        let probe = ScriptedProbe::constant(0.2, 0.3);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(3500)).await;
                cancel.cancel();
            }
        };

        let (metrics, _) = tokio::join!(monitor.monitor(PID, Box::new(probe), cancel), canceller);

        assert_eq!(metrics.samples_collected, 3);
        assert!((metrics.avg_cpu - 0.2).abs() < 1e-12);
        assert!((metrics.peak_mem - 0.3).abs() < 1e-12);
        assert!(!metrics.aborted);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_ends_monitor_with_partial_metrics() {
        let (monitor, _) = monitor(config(|_| {}));
        let probe = ScriptedProbe::new([(0.1, 0.2), (0.3, 0.4)]);

        let metrics = monitor.monitor(PID, Box::new(probe), CancellationToken::new()).await;

        assert_eq!(metrics.samples_collected, 2);
        assert_eq!(metrics.peak_cpu, 0.3);
        assert_eq!(metrics.peak_mem, 0.4);
        assert!(!metrics.aborted);
    }

    fn run_pattern() -> impl Strategy<Value = Vec<bool>> {
        // hot runs of at most 2 samples: with a 1s poll and 2s window a run
        // needs 3 consecutive hot samples to abort
        prop::collection::vec((1usize..=2, 1usize..=3), 1..20).prop_map(|runs| {
            runs.into_iter()
                .flat_map(|(hot, cool)| {
                    std::iter::repeat(true).take(hot).chain(std::iter::repeat(false).take(cool))
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_spikes_shorter_than_window_never_abort(pattern in run_pattern()) {
            let mut detector = BreachDetector::new(0.5, 0.9, Duration::from_secs(2), 1.0);
            let t0 = Instant::now();
            for (i, hot) in pattern.iter().enumerate() {
                let cpu = if *hot { 0.9 } else { 0.1 };
                let decision = detector.observe(
                    ResourceSample::new(cpu, 0.1),
                    t0 + Duration::from_secs(i as u64),
                );
                let sustained = matches!(decision, BreachDecision::Sustained { .. });
                prop_assert!(!sustained);
            }
        }

        #[test]
        fn prop_peak_bounds_mean(
            samples in prop::collection::vec((0.0f64..8.0, 0.0f64..1.0), 1..64)
        ) {
            let mut stats = RunningStats::default();
            for (cpu, mem) in samples {
                stats.record(ResourceSample::new(cpu, mem));
            }
            prop_assert!(stats.peak_cpu() >= stats.avg_cpu());
            prop_assert!(stats.peak_mem() >= stats.avg_mem());
        }
    }
}
