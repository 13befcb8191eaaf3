// SPDX-License-Identifier: MIT OR Apache-2.0
//! Low-level process spawning seam.
//!
//! Adapters and the supervisor only ever see [`ProcessManager`]; the tokio
//! implementation lives here, test doubles live with their tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::SupervisorError;

/// What to launch: command, arguments, working directory, environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable to run.
    pub command: String,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Working directory, if different from the parent's.
    pub cwd: Option<String>,
    /// Environment variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    /// Create a spec for the given command.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Kill severity, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Ask the process to exit (SIGTERM on unix).
    Graceful,
    /// Terminate the process (SIGKILL on unix).
    Forceful,
}

/// Exclusive control over a spawned process: waiting and signalling.
#[async_trait]
pub trait ProcessControl: Send {
    /// Wait for the process to exit, returning its exit code when the
    /// platform reports one.
    async fn wait(&mut self) -> Option<i32>;

    /// Deliver a kill signal. Errors are swallowed; the exit monitor
    /// observes the outcome either way.
    fn signal(&mut self, signal: KillSignal);
}

/// A freshly spawned process: pid, piped stdio, and its control handle.
pub struct SpawnedProcess {
    /// OS process id, if the platform reported one.
    pub pid: Option<u32>,
    /// Piped stdin. `None` is legal (platform or spec choice).
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Piped stdout. `None` is legal.
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Piped stderr. `None` is legal.
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Control handle for waiting and killing.
    pub control: Box<dyn ProcessControl>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.pid)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// The seam between supervision and the operating system.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn the process described by `spec` with fully piped stdio.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Spawn`] if the OS refuses the spawn.
    async fn spawn(&self, spec: &ProcessSpec) -> Result<SpawnedProcess, SupervisorError>;

    /// Whether a pid still refers to a live process.
    fn is_alive(&self, pid: u32) -> bool;
}

// ---------------------------------------------------------------------------
// Tokio implementation
// ---------------------------------------------------------------------------

/// Production [`ProcessManager`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessManager;

struct TokioControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for TokioControl {
    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(_) => None,
        }
    }

    fn signal(&mut self, signal: KillSignal) {
        match signal {
            KillSignal::Graceful => {
                #[cfg(unix)]
                if let Some(pid) = self.child.id() {
                    // SAFETY: kill(2) with a valid pid and SIGTERM has no
                    // memory-safety concerns; the worst outcome is ESRCH.
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                    return;
                }
                // No pid (already reaped) or non-unix: fall through to the
                // forceful path so escalation still converges.
                let _ = self.child.start_kill();
            }
            KillSignal::Forceful => {
                let _ = self.child.start_kill();
            }
        }
    }
}

#[async_trait]
impl ProcessManager for TokioProcessManager {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<SpawnedProcess, SupervisorError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: spec.command.clone(),
            source,
        })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>);
        let stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);

        Ok(SpawnedProcess {
            pid,
            stdin,
            stdout,
            stderr,
            control: Box::new(TokioControl { child }),
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            // SAFETY: kill(2) with signal 0 only performs the permission and
            // existence check.
            unsafe { libc::kill(pid as i32, 0) == 0 }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(unix)]
    async fn spawn_and_wait_reports_exit_code() {
        let manager = TokioProcessManager;
        let spec = ProcessSpec::new("/bin/sh").arg("-c").arg("exit 3");
        let mut spawned = manager.spawn(&spec).await.unwrap();
        assert!(spawned.pid.is_some());
        assert_eq!(spawned.control.wait().await, Some(3));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn graceful_signal_terminates_sleeper() {
        let manager = TokioProcessManager;
        let spec = ProcessSpec::new("/bin/sh").arg("-c").arg("sleep 30");
        let mut spawned = manager.spawn(&spec).await.unwrap();
        spawned.control.signal(KillSignal::Graceful);
        // SIGTERM death: no exit code.
        assert_eq!(spawned.control.wait().await, None);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn is_alive_tracks_process_lifetime() {
        let manager = TokioProcessManager;
        let spec = ProcessSpec::new("/bin/sh").arg("-c").arg("sleep 30");
        let mut spawned = manager.spawn(&spec).await.unwrap();
        let pid = spawned.pid.unwrap();
        assert!(manager.is_alive(pid));
        spawned.control.signal(KillSignal::Forceful);
        let _ = spawned.control.wait().await;
        assert!(!manager.is_alive(pid));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let manager = TokioProcessManager;
        let spec = ProcessSpec::new("/definitely/not/a/binary");
        let err = manager.spawn(&spec).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }
}
