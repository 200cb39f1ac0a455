// src/lib.rs
//! procwarden: resource-governed command execution
//!
//! Runs external commands concurrently, each in its own process group, and
//! enforces a wall-clock timeout plus CPU and memory limits on them. A
//! command whose smoothed usage stays over a limit for the breach window is
//! terminated (SIGTERM, grace period, SIGKILL) together with every process it
//! spawned.
//!
//! # Architecture
//!
//! - **runtime**: Process execution, sampling, breach detection, termination
//! - **observability**: Tracing and Prometheus metrics
//! - **utils**: Configuration and errors
//!
//! ```no_run
//! use procwarden::{Coordinator, GovernorConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> procwarden::Result<()> {
//! let config = GovernorConfig::load()?;
//! let coordinator = Coordinator::new(Arc::new(config.monitoring));
//! let result = coordinator
//!     .run_command(vec!["nmap".into(), "-sV".into(), "10.0.0.1".into()], Duration::from_secs(60))
//!     .await;
//! println!("{} -> {:?}", result.command, result.outcome);
//! # Ok(())
//! # }
//! ```

// Public module exports
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use runtime::aggregator::{CommandResult, Outcome};
pub use runtime::coordinator::Coordinator;
pub use runtime::process_manager::CommandSpec;
pub use utils::config::{GovernorConfig, MonitoringConfig};
pub use utils::errors::{GovernorError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
