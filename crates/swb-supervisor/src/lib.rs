// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! swb-supervisor
#![warn(missing_docs)]

/// Crash-based circuit breaker.
pub mod breaker;
/// Process spawning seam and the tokio implementation.
pub mod process;
/// The supervisor proper: handle table, kill escalation, stdio pump.
pub mod supervisor;

pub use breaker::{BreakerState, CircuitBreaker};
pub use process::{
    KillSignal, ProcessControl, ProcessManager, ProcessSpec, SpawnedProcess, TokioProcessManager,
};
pub use supervisor::{IoMode, ProcessIo, ProcessSupervisor, SupervisorConfig};

/// Errors raised by process supervision.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The OS refused to spawn the process.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// The command that failed.
        command: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// No supervised process exists for the session.
    #[error("no process for session {0}")]
    UnknownSession(String),
}
