// src/main.rs
//! procwarden
//!
//! Runs external commands under a timeout and CPU/memory limits and prints
//! one JSON result per command.

use anyhow::{bail, Context, Result};
use clap::Parser;
use procwarden::observability::{init_metrics, init_tracing};
use procwarden::{CommandResult, Coordinator, GovernorConfig};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "procwarden", version, about = "Run commands under resource governance")]
struct Cli {
    /// Timeout per command in seconds [default: RUNNER_DEFAULT_TIMEOUT]
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Read a JSON array of argv arrays from stdin
    #[arg(long, conflicts_with = "command")]
    batch: bool,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,

    /// Program and arguments to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
    command: Vec<String>,
}

fn resolve_timeout(cli: &Cli, config: &GovernorConfig) -> Result<Duration> {
    match cli.timeout {
        None => Ok(config.runner.default_timeout),
        Some(secs) => match Duration::try_from_secs_f64(secs) {
            Ok(timeout) if !timeout.is_zero() => Ok(timeout),
            _ => bail!("--timeout must be a positive number of seconds, got {}", secs),
        },
    }
}

async fn read_batch() -> Result<Vec<Vec<String>>> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read batch from stdin")?;
    serde_json::from_str(&input).context("batch must be a JSON array of argv arrays")
}

fn print_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", rendered);
    Ok(())
}

async fn run(cli: &Cli, coordinator: &Coordinator, timeout: Duration) -> Result<()> {
    if cli.batch {
        let commands = read_batch().await?;
        let results: Vec<CommandResult> = coordinator.run_commands(commands, timeout).await;
        return print_json(&results, cli.pretty);
    }

    if cli.command.is_empty() {
        bail!("no command given (pass PROGRAM [ARGS...] or --batch)");
    }
    let result = coordinator.run_command(cli.command.clone(), timeout).await;
    print_json(&result, cli.pretty)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = GovernorConfig::load()?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    info!(version = procwarden::VERSION, git = procwarden::GIT_HASH, "Starting procwarden");
    info!(config = ?config.monitoring, "Configuration loaded");

    let timeout = resolve_timeout(&cli, &config)?;
    let coordinator = Coordinator::from_config(&config);

    let work = run(&cli, &coordinator, timeout);
    tokio::pin!(work);

    tokio::select! {
        outcome = &mut work => return outcome,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            } else {
                warn!("Interrupted, terminating running commands");
                coordinator.shutdown();
            }
        }
    }

    // Results of interrupted commands are still reported
    work.await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_trailing_command() {
        let cli = Cli::parse_from(["procwarden", "--timeout", "2.5", "--", "nmap", "-sV", "host"]);
        assert_eq!(cli.timeout, Some(2.5));
        assert_eq!(cli.command, vec!["nmap", "-sV", "host"]);
        assert!(!cli.batch);
    }

    #[test]
    fn test_batch_conflicts_with_command() {
        assert!(Cli::try_parse_from(["procwarden", "--batch", "--", "ls"]).is_err());
    }

    #[test]
    fn test_resolve_timeout() {
        let config = GovernorConfig::default();
        let cli = Cli::parse_from(["procwarden", "ls"]);
        assert_eq!(resolve_timeout(&cli, &config).unwrap(), config.runner.default_timeout);

        let cli = Cli::parse_from(["procwarden", "--timeout", "0", "ls"]);
        assert!(resolve_timeout(&cli, &config).is_err());

        for bad in ["1e30", "-1", "NaN", "inf"] {
            let flag = format!("--timeout={}", bad);
            let cli = Cli::parse_from(["procwarden", flag.as_str(), "ls"]);
            assert!(resolve_timeout(&cli, &config).is_err(), "accepted {}", bad);
        }

        let cli = Cli::parse_from(["procwarden", "--timeout", "0.5", "ls"]);
        assert_eq!(resolve_timeout(&cli, &config).unwrap(), Duration::from_millis(500));
    }
}
