// SPDX-License-Identifier: MIT OR Apache-2.0
//! The supervisor proper: per-session handle table, kill escalation,
//! stdio pump, and exit monitoring feeding the circuit breaker.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use swb_telemetry::{BrokerEvent, EventBus};

use crate::SupervisorError;
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::process::{KillSignal, ProcessControl, ProcessManager, ProcessSpec};

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a graceful kill may take before escalation.
    pub kill_grace_period: Duration,
    /// Exits faster than this count as crashes.
    pub crash_threshold: Duration,
    /// Quick crashes in a row before the breaker opens.
    pub failure_threshold: u32,
    /// Prefix for error event sources (`"<prefix>:spawn"`).
    pub event_prefix: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            kill_grace_period: Duration::from_millis(5_000),
            crash_threshold: Duration::from_millis(100),
            failure_threshold: 5,
            event_prefix: "process".into(),
        }
    }
}

/// Whether the caller keeps the protocol streams or the supervisor pumps
/// them into broker events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Caller takes stdin/stdout (protocol traffic); supervisor pumps stderr.
    Piped,
    /// Supervisor pumps both stdout and stderr into broker events.
    Pumped,
}

/// Stdio returned to the caller for a spawn.
pub struct ProcessIo {
    /// OS process id, if the platform reported one.
    pub pid: Option<u32>,
    /// Piped stdin, when the platform provided one.
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Piped stdout for [`IoMode::Piped`] spawns; `None` when pumped.
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

/// Exit state published by the monitor task. `None` while running.
type ExitSlot = Option<Option<i32>>;

#[derive(Clone)]
struct Entry {
    generation: u64,
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<KillSignal>,
    exit_rx: watch::Receiver<ExitSlot>,
}

type ProcessTable = Arc<Mutex<HashMap<String, Entry>>>;

/// Supervises the subprocesses of one adapter family.
///
/// One supervisor owns one circuit breaker: the breaker protects a binary,
/// not a session.
pub struct ProcessSupervisor {
    manager: Arc<dyn ProcessManager>,
    config: SupervisorConfig,
    bus: EventBus,
    processes: ProcessTable,
    breaker: Arc<Mutex<CircuitBreaker>>,
    generations: AtomicU64,
}

impl ProcessSupervisor {
    /// Create a supervisor over the given process manager and event bus.
    #[must_use]
    pub fn new(manager: Arc<dyn ProcessManager>, config: SupervisorConfig, bus: EventBus) -> Self {
        let breaker = CircuitBreaker::new(config.failure_threshold);
        Self {
            manager,
            config,
            bus,
            processes: Arc::new(Mutex::new(HashMap::new())),
            breaker: Arc::new(Mutex::new(breaker)),
            generations: AtomicU64::new(0),
        }
    }

    /// Spawn a process for `session_id`.
    ///
    /// Returns `None` (after emitting an `error` event) when the breaker is
    /// open or the OS refuses the spawn; a spawn failure also records a
    /// breaker failure.
    pub async fn spawn_process(
        &self,
        session_id: &str,
        spec: ProcessSpec,
        io: IoMode,
    ) -> Option<ProcessIo> {
        let source = format!("{}:spawn", self.config.event_prefix);

        if !self.can_restart() {
            self.bus.publish(BrokerEvent::Error {
                session_id: Some(session_id.to_string()),
                source,
                message: format!("circuit breaker open for `{}`", spec.command),
            });
            return None;
        }

        let mut spawned = match self.manager.spawn(&spec).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.breaker
                    .lock()
                    .expect("breaker lock poisoned")
                    .record_failure();
                self.bus.publish(BrokerEvent::Error {
                    session_id: Some(session_id.to_string()),
                    source,
                    message: e.to_string(),
                });
                return None;
            }
        };

        let pid = spawned.pid;
        debug!(target: "swb.supervisor", session_id, pid, command = %spec.command, "spawned");

        // Stderr is always pumped; stdout only when the caller does not
        // keep it for protocol traffic.
        if let Some(stderr) = spawned.stderr.take() {
            let session = session_id.to_string();
            let bus = self.bus.clone();
            tokio::spawn(pump_lines(stderr, move |line| {
                bus.publish(BrokerEvent::ProcessStderr {
                    session_id: session.clone(),
                    line,
                });
            }));
        }
        let stdout = match io {
            IoMode::Piped => spawned.stdout.take(),
            IoMode::Pumped => {
                if let Some(stdout) = spawned.stdout.take() {
                    let session = session_id.to_string();
                    let bus = self.bus.clone();
                    tokio::spawn(pump_lines(stdout, move |line| {
                        bus.publish(BrokerEvent::ProcessStdout {
                            session_id: session.clone(),
                            line,
                        });
                    }));
                }
                None
            }
        };

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel::<ExitSlot>(None);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        self.processes
            .lock()
            .expect("process table lock poisoned")
            .insert(
                session_id.to_string(),
                Entry {
                    generation,
                    pid,
                    kill_tx,
                    exit_rx,
                },
            );

        spawn_monitor(MonitorArgs {
            session_id: session_id.to_string(),
            generation,
            control: spawned.control,
            kill_rx,
            exit_tx,
            bus: self.bus.clone(),
            breaker: Arc::clone(&self.breaker),
            table: Arc::clone(&self.processes),
            crash_threshold: self.config.crash_threshold,
        });

        self.bus.publish(BrokerEvent::ProcessSpawned {
            session_id: session_id.to_string(),
            pid,
        });

        Some(ProcessIo {
            pid,
            stdin: spawned.stdin.take(),
            stdout,
        })
    }

    /// Kill the process bound to `session_id`, escalating graceful →
    /// forceful after the grace period, and await confirmed exit.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownSession`] when no process is
    /// supervised for the session.
    pub async fn kill_process(&self, session_id: &str) -> Result<(), SupervisorError> {
        let entry = self
            .processes
            .lock()
            .expect("process table lock poisoned")
            .get(session_id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownSession(session_id.to_string()))?;

        let _ = entry.kill_tx.send(KillSignal::Graceful);

        let exited = timeout(
            self.config.kill_grace_period,
            wait_for_exit(entry.exit_rx.clone()),
        )
        .await;

        if exited.is_err() {
            warn!(target: "swb.supervisor", session_id, "graceful kill expired, escalating");
            let _ = entry.kill_tx.send(KillSignal::Forceful);
            wait_for_exit(entry.exit_rx.clone()).await;
        }

        // The monitor removes the entry on exit; clear a same-generation
        // leftover in case it lost the race.
        let mut processes = self.processes.lock().expect("process table lock poisoned");
        if processes
            .get(session_id)
            .is_some_and(|e| e.generation == entry.generation)
        {
            processes.remove(session_id);
        }
        Ok(())
    }

    /// Kill every supervised process concurrently.
    pub async fn kill_all_processes(&self) {
        let sessions: Vec<String> = self
            .processes
            .lock()
            .expect("process table lock poisoned")
            .keys()
            .cloned()
            .collect();
        let results = join_all(sessions.iter().map(|s| self.kill_process(s))).await;
        for result in results {
            let _ = result;
        }
    }

    /// The pid supervised for a session, if any.
    #[must_use]
    pub fn pid_of(&self, session_id: &str) -> Option<u32> {
        self.processes
            .lock()
            .expect("process table lock poisoned")
            .get(session_id)
            .and_then(|e| e.pid)
    }

    /// Number of currently supervised processes.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.processes
            .lock()
            .expect("process table lock poisoned")
            .len()
    }

    /// Whether the breaker currently permits restarts.
    #[must_use]
    pub fn can_restart(&self) -> bool {
        self.breaker
            .lock()
            .expect("breaker lock poisoned")
            .can_restart()
    }

    /// Current breaker position.
    #[must_use]
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().expect("breaker lock poisoned").state()
    }

    /// Allow one probe spawn while the breaker is open.
    pub fn allow_probe(&self) {
        self.breaker
            .lock()
            .expect("breaker lock poisoned")
            .allow_probe();
    }

    /// Whether the pid supervised for a session is still alive per the OS.
    #[must_use]
    pub fn is_alive(&self, session_id: &str) -> bool {
        self.pid_of(session_id)
            .is_some_and(|pid| self.manager.is_alive(pid))
    }
}

struct MonitorArgs {
    session_id: String,
    generation: u64,
    control: Box<dyn ProcessControl>,
    kill_rx: mpsc::UnboundedReceiver<KillSignal>,
    exit_tx: watch::Sender<ExitSlot>,
    bus: EventBus,
    breaker: Arc<Mutex<CircuitBreaker>>,
    table: ProcessTable,
    crash_threshold: Duration,
}

fn spawn_monitor(args: MonitorArgs) {
    let MonitorArgs {
        session_id,
        generation,
        mut control,
        mut kill_rx,
        exit_tx,
        bus,
        breaker,
        table,
        crash_threshold,
    } = args;
    let started = Instant::now();

    tokio::spawn(async move {
        let code = loop {
            tokio::select! {
                code = control.wait() => break code,
                Some(signal) = kill_rx.recv() => control.signal(signal),
            }
        };

        let uptime = started.elapsed();
        let state = {
            let mut breaker = breaker.lock().expect("breaker lock poisoned");
            if uptime >= crash_threshold {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
            breaker.state()
        };

        {
            let mut processes = table.lock().expect("process table lock poisoned");
            if processes
                .get(&session_id)
                .is_some_and(|e| e.generation == generation)
            {
                processes.remove(&session_id);
            }
        }

        let _ = exit_tx.send(Some(code));
        bus.publish(BrokerEvent::ProcessExited {
            session_id,
            exit_code: code,
            uptime_ms: uptime.as_millis() as u64,
            circuit_breaker: state.as_str().to_string(),
        });
    });
}

async fn wait_for_exit(mut rx: watch::Receiver<ExitSlot>) -> Option<i32> {
    loop {
        let current = *rx.borrow();
        if let Some(code) = current {
            return code;
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

/// Read `reader` line by line, invoking `emit` for every non-empty trimmed
/// line. Stream errors end the pump without touching the process.
async fn pump_lines<R>(reader: R, emit: impl Fn(String) + Send + 'static)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    emit(trimmed.to_string());
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(target: "swb.supervisor", "stdio pump ended: {e}");
                break;
            }
        }
    }
}
