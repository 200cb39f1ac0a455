// src/observability/mod.rs
//! Tracing and metrics setup
//!
//! Logs are structured `tracing` events; every command runs inside a
//! `command` span carrying its `run_id`, so key/value context survives into
//! both the console and the JSON formatter.
//!
//! Metrics go through the `metrics` facade and are exported in Prometheus
//! format when `RUNNER_METRICS_ADDR` is set. Without an installed recorder
//! every metric call is a no-op.

use crate::runtime::aggregator::Outcome;
use crate::runtime::terminator::TerminationOutcome;
use crate::utils::config::{LogFormat, ObservabilityConfig};
use crate::utils::errors::{GovernorError, Result};
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const COMMANDS_TOTAL: &str = "procwarden_commands_total";
pub const ABORTS_TOTAL: &str = "procwarden_aborts_total";
pub const TERMINATIONS_TOTAL: &str = "procwarden_terminations_total";
pub const COMMAND_DURATION_SECONDS: &str = "procwarden_command_duration_seconds";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| GovernorError::Observability(format!("invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.log_format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Console => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| GovernorError::Observability(format!("tracing init failed: {}", e)))
}

/// Install the Prometheus exporter if a listen address is configured
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(addr) = config.metrics_addr.as_deref() else {
        debug!("Metrics exporter disabled");
        return Ok(());
    };

    let addr: SocketAddr = addr.parse().map_err(|e| {
        GovernorError::Observability(format!("invalid metrics address '{}': {}", addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| GovernorError::Observability(format!("metrics exporter failed: {}", e)))?;

    describe_counter!(COMMANDS_TOTAL, "Commands executed, by terminal outcome");
    describe_counter!(ABORTS_TOTAL, "Commands aborted for sustained resource usage");
    describe_counter!(TERMINATIONS_TOTAL, "Termination escalations, by result");
    describe_histogram!(COMMAND_DURATION_SECONDS, Unit::Seconds, "Wall time per command");

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

pub(crate) fn record_command(outcome: Outcome, elapsed: Duration) {
    counter!(COMMANDS_TOTAL, "outcome" => outcome.as_str()).increment(1);
    histogram!(COMMAND_DURATION_SECONDS).record(elapsed.as_secs_f64());
    if outcome == Outcome::Aborted {
        counter!(ABORTS_TOTAL).increment(1);
    }
}

pub(crate) fn record_termination(outcome: &TerminationOutcome) {
    counter!(TERMINATIONS_TOTAL, "outcome" => outcome.as_str()).increment(1);
}
