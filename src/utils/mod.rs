// src/utils/mod.rs
//! Common utilities: configuration loading and error types

pub mod config;
pub mod errors;

pub use config::{
    GovernorConfig, LogFormat, MonitoringConfig, ObservabilityConfig, RunnerConfig,
    SmoothingMethod,
};
pub use errors::{GovernorError, Result};
