// src/utils/config.rs
//! Configuration for the governor
//!
//! Settings are layered with the `config` crate:
//!
//! 1. Built-in defaults
//! 2. Optional file `procwarden.{toml,yaml,json}` (path overridable via `PROCWARDEN_CONFIG`)
//! 3. `RUNNER_*` environment variables (`RUNNER_CPU_LIMIT`, `RUNNER_BREACH_WINDOW`, ...)
//!
//! The result is validated once and handed out as an immutable snapshot.
//!
//! # CPU accounting
//!
//! `cpu_limit` and every CPU sample are fractions of **one core**: CPU time
//! consumed divided by wall time elapsed. A single-threaded busy loop reads
//! about 1.0, a process saturating four cores reads about 4.0, so limits above
//! 1.0 are meaningful for multi-threaded tools.
//!
//! Memory is resident set size divided by total physical memory.

use crate::utils::errors::{GovernorError, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "RUNNER";

/// Environment variable naming an alternative config file
pub const CONFIG_PATH_VAR: &str = "PROCWARDEN_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "procwarden";

/// Upper bound for `kill_grace`
pub const MAX_KILL_GRACE: Duration = Duration::from_secs(3600);

/// Smoothing applied to samples before breach detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothingMethod {
    /// Exponential moving average weighted by `smoothing_alpha`
    Ema,
    /// Raw samples
    None,
}

impl FromStr for SmoothingMethod {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ema" => Ok(SmoothingMethod::Ema),
            "none" | "raw" => Ok(SmoothingMethod::None),
            other => Err(GovernorError::InvalidConfig(format!(
                "unknown smoothing method '{}' (expected 'ema' or 'none')",
                other
            ))),
        }
    }
}

/// Resource governance thresholds, read-only for the lifetime of the process
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringConfig {
    /// CPU limit as a fraction of one core
    pub cpu_limit: f64,

    /// Memory limit as a fraction of total physical memory (0-1)
    pub mem_limit: f64,

    /// How long the smoothed usage must stay over a limit before aborting
    pub breach_window: Duration,

    /// Interval between two samples
    pub poll_interval: Duration,

    /// Smoothing method
    pub smoothing: SmoothingMethod,

    /// EMA weight of the newest sample (0-1)
    pub smoothing_alpha: f64,

    /// Wait between SIGTERM and SIGKILL
    pub kill_grace: Duration,

    /// Sample and abort runaway processes
    pub abort_enabled: bool,

    /// Detect and log breaches but never signal
    pub abort_dry_run: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            cpu_limit: 0.80,
            mem_limit: 0.75,
            breach_window: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            smoothing: SmoothingMethod::Ema,
            smoothing_alpha: 0.3,
            kill_grace: Duration::from_secs(5),
            abort_enabled: true,
            abort_dry_run: false,
        }
    }
}

impl MonitoringConfig {
    /// Whether the monitor samples at all.
    ///
    /// Dry-run mode samples even when aborting is disabled; only the
    /// termination is suppressed.
    pub fn sampling_enabled(&self) -> bool {
        self.abort_enabled || self.abort_dry_run
    }

    /// Weight given to the newest sample, 1.0 when smoothing is off
    pub fn effective_alpha(&self) -> f64 {
        match self.smoothing {
            SmoothingMethod::Ema => self.smoothing_alpha,
            SmoothingMethod::None => 1.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.cpu_limit.is_finite() || self.cpu_limit <= 0.0 {
            return Err(GovernorError::InvalidConfig(format!(
                "cpu_limit must be a positive number, got {}",
                self.cpu_limit
            )));
        }
        if !(self.mem_limit > 0.0 && self.mem_limit <= 1.0) {
            return Err(GovernorError::InvalidConfig(format!(
                "mem_limit must be in (0, 1], got {}",
                self.mem_limit
            )));
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return Err(GovernorError::InvalidConfig(format!(
                "smoothing_alpha must be in (0, 1], got {}",
                self.smoothing_alpha
            )));
        }
        if self.breach_window.is_zero() {
            return Err(GovernorError::InvalidConfig(
                "breach_window must be positive".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(GovernorError::InvalidConfig(
                "poll_interval must be positive".to_string(),
            ));
        }
        if self.kill_grace > MAX_KILL_GRACE {
            return Err(GovernorError::InvalidConfig(format!(
                "kill_grace must not exceed {:?}, got {:?}",
                MAX_KILL_GRACE, self.kill_grace
            )));
        }
        if self.poll_interval > self.breach_window {
            return Err(GovernorError::InvalidConfig(format!(
                "poll_interval ({:?}) must not exceed breach_window ({:?})",
                self.poll_interval, self.breach_window
            )));
        }
        Ok(())
    }
}

/// Batch execution settings
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Timeout applied when a caller does not pass one
    pub default_timeout: Duration,

    /// Cap on concurrently running commands (`None` = unbounded)
    pub max_concurrency: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            max_concurrency: None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Console,
    Json,
}

impl FromStr for LogFormat {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "pretty" | "text" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            other => Err(GovernorError::InvalidConfig(format!(
                "unknown log format '{}' (expected 'console' or 'json')",
                other
            ))),
        }
    }
}

/// Logging and metrics settings
#[derive(Debug, Clone, PartialEq)]
pub struct ObservabilityConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub log_level: String,

    pub log_format: LogFormat,

    /// Prometheus listen address, exporter disabled when unset
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Console,
            metrics_addr: None,
        }
    }
}

/// Complete governor configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GovernorConfig {
    pub monitoring: MonitoringConfig,
    pub runner: RunnerConfig,
    pub observability: ObservabilityConfig,
}

/// Flat on-disk/env representation; durations are seconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Settings {
    cpu_limit: f64,
    mem_limit: f64,
    breach_window: f64,
    poll_interval: f64,
    smoothing: String,
    smoothing_alpha: f64,
    kill_grace: f64,
    abort_enable: bool,
    abort_dry_run: bool,
    default_timeout: f64,
    max_concurrency: Option<usize>,
    log_level: String,
    log_format: String,
    metrics_addr: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let monitoring = MonitoringConfig::default();
        let runner = RunnerConfig::default();
        let observability = ObservabilityConfig::default();
        Self {
            cpu_limit: monitoring.cpu_limit,
            mem_limit: monitoring.mem_limit,
            breach_window: monitoring.breach_window.as_secs_f64(),
            poll_interval: monitoring.poll_interval.as_secs_f64(),
            smoothing: "ema".to_string(),
            smoothing_alpha: monitoring.smoothing_alpha,
            kill_grace: monitoring.kill_grace.as_secs_f64(),
            abort_enable: monitoring.abort_enabled,
            abort_dry_run: monitoring.abort_dry_run,
            default_timeout: runner.default_timeout.as_secs_f64(),
            max_concurrency: runner.max_concurrency,
            log_level: observability.log_level,
            log_format: "console".to_string(),
            metrics_addr: None,
        }
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        GovernorError::InvalidConfig(format!(
            "{} must be a non-negative number of seconds, got {}",
            name, value
        ))
    })
}

impl TryFrom<Settings> for GovernorConfig {
    type Error = GovernorError;

    fn try_from(settings: Settings) -> Result<Self> {
        let monitoring = MonitoringConfig {
            cpu_limit: settings.cpu_limit,
            mem_limit: settings.mem_limit,
            breach_window: seconds("breach_window", settings.breach_window)?,
            poll_interval: seconds("poll_interval", settings.poll_interval)?,
            smoothing: settings.smoothing.parse()?,
            smoothing_alpha: settings.smoothing_alpha,
            kill_grace: seconds("kill_grace", settings.kill_grace)?,
            abort_enabled: settings.abort_enable,
            abort_dry_run: settings.abort_dry_run,
        };
        monitoring.validate()?;

        let default_timeout = seconds("default_timeout", settings.default_timeout)?;
        if default_timeout.is_zero() {
            return Err(GovernorError::InvalidConfig(
                "default_timeout must be positive".to_string(),
            ));
        }
        if settings.max_concurrency == Some(0) {
            return Err(GovernorError::InvalidConfig(
                "max_concurrency must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            monitoring,
            runner: RunnerConfig {
                default_timeout,
                max_concurrency: settings.max_concurrency,
            },
            observability: ObservabilityConfig {
                log_level: settings.log_level,
                log_format: settings.log_format.parse()?,
                metrics_addr: settings.metrics_addr.filter(|addr| !addr.trim().is_empty()),
            },
        })
    }
}

impl GovernorConfig {
    /// Load from the optional config file and the process environment.
    ///
    /// `LOG_FORMAT` is honoured alongside `RUNNER_LOG_FORMAT`.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let builder = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .set_override_option("log_format", std::env::var("LOG_FORMAT").ok())?;

        Self::from_builder(builder)
    }

    /// Load from an explicit set of `RUNNER_*` variables instead of the
    /// process environment
    pub fn from_env_map<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: config::Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let builder = Config::builder().add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(Some(map)),
        );

        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.try_into()
    }
}
