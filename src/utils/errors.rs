// src/utils/errors.rs
//! Error types for governed process execution

use std::io;
use thiserror::Error;

/// Result type for governor operations
pub type Result<T> = std::result::Result<T, GovernorError>;

/// Errors that can occur while launching, observing or stopping a command
#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to start {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for process: {0}")]
    Wait(io::Error),

    #[error("Observability setup failed: {0}")]
    Observability(String),
}

impl GovernorError {
    pub fn spawn_failed(program: impl Into<String>, source: io::Error) -> Self {
        Self::SpawnFailed {
            program: program.into(),
            source,
        }
    }

    /// True when the program could not be found or is not executable
    pub fn is_missing_binary(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailed { source, .. } if matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            )
        )
    }
}
