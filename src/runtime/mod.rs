// src/runtime/mod.rs
//! Governed command execution runtime
//!
//! This module provides the core execution environment, including:
//!
//! - **Process Manager**: Spawning commands in their own process group
//! - **Probe**: Per-process CPU and memory sampling from `/proc`
//! - **Resource Monitor**: Smoothing, breach detection and abort decisions
//! - **Terminator**: SIGTERM, grace period, SIGKILL escalation on the group
//! - **Aggregator**: Merging exit status and measurements into a result
//! - **Coordinator**: Running commands and batches end to end
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Coordinator                        │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐               │
//! │  │ command  │  │ command  │  │ command  │  ...          │
//! │  │  task    │  │  task    │  │  task    │               │
//! │  └────┬─────┘  └────┬─────┘  └────┬─────┘               │
//! │       │ per command │             │                     │
//! │       ▼             ▼             ▼                     │
//! │  Process Manager ◀──── Terminator ◀──── Resource Monitor │
//! │       │                                   ▲             │
//! │       │ exit / timeout            Probe ──┘             │
//! │       ▼                                                 │
//! │   Aggregator ──▶ CommandResult (input order)            │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod aggregator;
pub mod coordinator;
pub mod probe;
pub mod process_manager;
pub mod resource_monitor;
pub mod terminator;

// Re-export commonly used types
pub use aggregator::{CommandResult, Outcome};
pub use coordinator::Coordinator;
pub use probe::{
    ProbeError, ProbeFactory, ProcProbe, ProcProbeFactory, ProcessProbe, ResourceSample,
};
pub use process_manager::{CommandSpec, ExecOutcome, ProcessManager, WaitControl};
pub use resource_monitor::{BreachDecision, BreachDetector, MonitorMetrics, ResourceMonitor};
pub use terminator::{
    NixSignalSender, SignalSender, TerminationOutcome, TerminationReason, Terminator,
};
