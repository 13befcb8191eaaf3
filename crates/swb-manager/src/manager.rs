// SPDX-License-Identifier: MIT OR Apache-2.0
//! The session manager: composition root, reapers, relaunch dedup.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use swb_adapter::AdapterRegistry;
use swb_bridge::{
    BridgeConfig, BridgeError, CancelToken, ConnectBackendOptions, SessionBridge, SessionHandle,
};
use swb_config::SwitchboardConfig;
use swb_supervisor::ProcessSupervisor;
use swb_telemetry::{BrokerEvent, EventBus, MetricsCollector};

use crate::launcher::{Launcher, LauncherSessionInfo, LauncherSessionState};
use crate::registry::SessionRegistry;
use crate::storage::{
    LauncherStateStorage, RegistrySessionState, SessionRecord, SessionStorage, StorageError,
};

/// Manager-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Persistence failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Bridge / adapter failure.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// The consumer-facing transport (WebSocket server or equivalent).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start listening, routing connections into the bridge.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Transport`] when listening fails.
    async fn start(&self, bridge: SessionBridge) -> Result<(), ManagerError>;

    /// Stop listening.
    async fn stop(&self);
}

/// Options for creating a session.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    /// Working directory for the backend.
    pub cwd: Option<String>,
    /// Adapter override; the configured default otherwise.
    pub adapter_name: Option<String>,
}

/// Management-surface snapshot of one session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionOverview {
    /// Session id.
    pub session_id: String,
    /// Adapter name from the registry.
    pub adapter_name: String,
    /// Working directory.
    pub cwd: Option<String>,
    /// Whether a backend is currently bound.
    pub cli_connected: bool,
    /// Attached consumer count.
    pub consumers: usize,
    /// Archived flag.
    pub archived: bool,
}

struct ManagerInner {
    config: SwitchboardConfig,
    bridge: SessionBridge,
    bus: EventBus,
    metrics: MetricsCollector,
    registry: SessionRegistry,
    launcher: Launcher,
    supervisors: Vec<Arc<ProcessSupervisor>>,
    transport: Option<Arc<dyn Transport>>,
    relaunching: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancelToken,
}

/// The composition root wiring adapters, bridge, registry, and reapers.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Build a manager from configuration and collaborators.
    #[must_use]
    pub fn new(
        config: SwitchboardConfig,
        adapters: Arc<AdapterRegistry>,
        session_storage: Arc<dyn SessionStorage>,
        launcher_storage: Arc<dyn LauncherStateStorage>,
    ) -> Self {
        Self::with_bus(
            config,
            adapters,
            session_storage,
            launcher_storage,
            EventBus::new(),
        )
    }

    /// Build a manager over an externally owned event bus (shared with
    /// supervisors and the management plane).
    #[must_use]
    pub fn with_bus(
        config: SwitchboardConfig,
        adapters: Arc<AdapterRegistry>,
        session_storage: Arc<dyn SessionStorage>,
        launcher_storage: Arc<dyn LauncherStateStorage>,
        bus: EventBus,
    ) -> Self {
        let bridge = SessionBridge::new(
            adapters,
            BridgeConfig {
                default_adapter: config.default_adapter.clone(),
                auth_timeout: Duration::from_millis(config.auth_timeout_ms),
                capabilities_timeout: Duration::from_millis(config.capabilities_timeout_ms),
            },
        )
        .with_bus(bus.clone());

        Self {
            inner: Arc::new(ManagerInner {
                config,
                bridge,
                bus,
                metrics: MetricsCollector::new(),
                registry: SessionRegistry::new(session_storage),
                launcher: Launcher::new(launcher_storage),
                supervisors: Vec::new(),
                transport: None,
                relaunching: Mutex::new(HashSet::new()),
                tasks: Mutex::new(Vec::new()),
                shutdown: CancelToken::new(),
            }),
        }
    }

    /// Register process supervisors so `stop` and `delete_session` can kill.
    #[must_use]
    pub fn with_supervisors(mut self, supervisors: Vec<Arc<ProcessSupervisor>>) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("manager not yet shared");
        inner.supervisors = supervisors;
        self
    }

    /// Attach the consumer transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("manager not yet shared");
        inner.transport = Some(transport);
        self
    }

    /// The bridge this manager composes.
    #[must_use]
    pub fn bridge(&self) -> &SessionBridge {
        &self.inner.bridge
    }

    /// The event bus shared across the composition.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Counters over every broker event the pump has observed.
    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    /// The session registry.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Management snapshot of every registered session.
    #[must_use]
    pub fn session_overviews(&self) -> Vec<SessionOverview> {
        self.inner
            .registry
            .list()
            .into_iter()
            .map(|record| {
                let live = self.inner.bridge.session(&record.session_id);
                SessionOverview {
                    cli_connected: live.as_ref().is_some_and(|s| s.cli_connected()),
                    consumers: live.as_ref().map_or(0, |s| s.consumer_count()),
                    session_id: record.session_id,
                    adapter_name: record.adapter_name,
                    cwd: record.cwd,
                    archived: record.archived,
                }
            })
            .collect()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Restore persisted state, start reapers and the transport.
    ///
    /// Launcher state restores before bridge/registry state so the bridge
    /// sees a consistent picture.
    ///
    /// # Errors
    ///
    /// Propagates storage and transport failures.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let launcher_sessions = self.inner.launcher.restore().await?;
        info!(
            target: "swb.manager",
            restored = launcher_sessions.len(),
            "launcher state restored"
        );

        let records = self.inner.registry.restore().await?;
        for record in &records {
            let session = self.inner.bridge.get_or_create_session(&record.session_id);
            let mut core = session.core.lock().await;
            core.adapter_name = Some(record.adapter_name.clone());
            core.backend_session_id = record.backend_session_id.clone();
            core.state.cwd = record.cwd.clone();
        }
        info!(target: "swb.manager", restored = records.len(), "session registry restored");

        self.spawn_event_pump();
        self.spawn_reconnect_watchdog(records);
        self.spawn_idle_reaper();

        if let Some(transport) = &self.inner.transport {
            transport.start(self.inner.bridge.clone()).await?;
        }
        Ok(())
    }

    /// Stop everything: timers, transport, processes, bridge.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        for task in self.inner.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
        if let Some(transport) = &self.inner.transport {
            transport.stop().await;
        }
        for supervisor in &self.inner.supervisors {
            supervisor.kill_all_processes().await;
        }
        self.inner.bridge.close_all().await;
    }

    // ── Session operations ──────────────────────────────────────────────

    /// Create and connect a new session, cleaning up on failure.
    ///
    /// # Errors
    ///
    /// Propagates registry and connect failures; the registry entry is
    /// removed when the connect fails.
    pub async fn create_session(&self, opts: CreateSessionOptions) -> Result<String, ManagerError> {
        let session_id = Uuid::new_v4().to_string();
        let adapter_name = opts
            .adapter_name
            .clone()
            .unwrap_or_else(|| self.inner.config.default_adapter.clone());

        self.inner
            .registry
            .register(SessionRecord {
                session_id: session_id.clone(),
                adapter_name: adapter_name.clone(),
                cwd: opts.cwd.clone(),
                backend_session_id: None,
                archived: false,
                state: RegistrySessionState::Starting,
            })
            .await?;
        self.inner
            .launcher
            .track(LauncherSessionInfo {
                session_id: session_id.clone(),
                pid: None,
                adapter_name: adapter_name.clone(),
                cwd: opts.cwd.clone(),
                state: LauncherSessionState::Starting,
                archived: false,
                backend_session_id: None,
            })
            .await?;

        {
            let session = self.inner.bridge.get_or_create_session(&session_id);
            let mut core = session.core.lock().await;
            core.adapter_name = Some(adapter_name);
            core.state.cwd = opts.cwd.clone();
        }

        let connect = self
            .inner
            .bridge
            .connect_backend(
                &session_id,
                ConnectBackendOptions {
                    cwd: opts.cwd,
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = connect {
            // Session table stays clean on connect failure.
            let _ = self.inner.registry.remove(&session_id).await;
            let _ = self.inner.launcher.remove(&session_id).await;
            self.inner.bridge.remove_session(&session_id).await;
            return Err(e.into());
        }

        self.inner.registry.mark_connected(&session_id).await?;
        Ok(session_id)
    }

    /// Kill, close, and deregister a session.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), ManagerError> {
        for supervisor in &self.inner.supervisors {
            let _ = supervisor.kill_process(session_id).await;
        }
        self.inner.bridge.remove_session(session_id).await;
        self.inner.registry.remove(session_id).await?;
        self.inner.launcher.remove(session_id).await?;
        Ok(())
    }

    /// Archive a session: it survives in the registry but never relaunches.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn archive_session(&self, session_id: &str) -> Result<(), ManagerError> {
        self.inner.registry.archive(session_id).await?;
        Ok(())
    }

    // ── Background tasks ────────────────────────────────────────────────

    fn spawn_event_pump(&self) {
        let manager = self.clone();
        let mut sub = self.inner.bus.subscribe();
        let shutdown = self.inner.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = sub.recv() => {
                        let Some(event) = event else { break };
                        manager.inner.metrics.record(&event);
                        manager.handle_event(event).await;
                    }
                }
            }
        });
        self.inner.tasks.lock().expect("task lock poisoned").push(task);
    }

    async fn handle_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::BackendSessionId {
                session_id,
                backend_session_id,
            } => {
                let _ = self
                    .inner
                    .launcher
                    .set_cli_session_id(&session_id, &backend_session_id)
                    .await;
                let _ = self
                    .inner
                    .registry
                    .set_backend_session_id(&session_id, &backend_session_id)
                    .await;
            }
            BrokerEvent::ProcessSpawned { session_id, pid } => {
                let _ = self.inner.launcher.set_pid(&session_id, pid).await;
            }
            BrokerEvent::ProcessExited { session_id, .. } => {
                // A dead agent process under a watched session wants a
                // relaunch; abandoned sessions are left for the reaper.
                let watched = self
                    .inner
                    .bridge
                    .session(&session_id)
                    .is_some_and(|s| s.consumer_count() > 0);
                let archived = self
                    .inner
                    .registry
                    .get(&session_id)
                    .is_some_and(|r| r.archived);
                if watched && !archived {
                    self.inner
                        .bus
                        .publish(BrokerEvent::BackendRelaunchNeeded { session_id });
                }
            }
            BrokerEvent::BackendConnected { session_id, .. } => {
                let _ = self.inner.registry.mark_connected(&session_id).await;
            }
            BrokerEvent::BackendRelaunchNeeded { session_id } => {
                self.try_relaunch(&session_id);
            }
            _ => {}
        }
    }

    /// Relaunch with dedup: a session already in the window is skipped, and
    /// archived sessions never relaunch.
    fn try_relaunch(&self, session_id: &str) {
        if self
            .inner
            .registry
            .get(session_id)
            .is_some_and(|r| r.archived)
        {
            return;
        }
        {
            let mut relaunching = self
                .inner
                .relaunching
                .lock()
                .expect("relaunch set lock poisoned");
            if !relaunching.insert(session_id.to_string()) {
                return;
            }
        }

        let manager = self.clone();
        let session_id = session_id.to_string();
        let dedup = Duration::from_millis(self.inner.config.relaunch_dedup_ms);
        tokio::spawn(async move {
            if let Err(e) = manager
                .inner
                .bridge
                .connect_backend(&session_id, ConnectBackendOptions::default())
                .await
            {
                warn!(target: "swb.manager", session_id, "relaunch failed: {e}");
            }
            tokio::time::sleep(dedup).await;
            manager
                .inner
                .relaunching
                .lock()
                .expect("relaunch set lock poisoned")
                .remove(&session_id);
        });
    }

    fn spawn_reconnect_watchdog(&self, restored: Vec<SessionRecord>) {
        if restored.is_empty() {
            return;
        }
        let manager = self.clone();
        let grace = Duration::from_millis(self.inner.config.reconnect_grace_period_ms);
        let shutdown = self.inner.shutdown.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                () = tokio::time::sleep(grace) => {}
            }
            for record in restored {
                if record.archived {
                    continue;
                }
                let still_starting = manager
                    .inner
                    .bridge
                    .session(&record.session_id)
                    .is_some_and(|s| !s.cli_connected());
                if still_starting {
                    info!(
                        target: "swb.manager",
                        session_id = %record.session_id,
                        "reconnect grace expired, relaunching"
                    );
                    manager.try_relaunch(&record.session_id);
                }
            }
        });
        self.inner.tasks.lock().expect("task lock poisoned").push(task);
    }

    fn spawn_idle_reaper(&self) {
        let timeout_ms = self.inner.config.idle_session_timeout_ms;
        if timeout_ms <= 0 {
            return;
        }
        let idle = Duration::from_millis(timeout_ms as u64);
        let interval = std::cmp::max(idle / 10, Duration::from_secs(1));
        let manager = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                manager.reap_idle_sessions(idle).await;
            }
        });
        self.inner.tasks.lock().expect("task lock poisoned").push(task);
    }

    async fn reap_idle_sessions(&self, idle: Duration) {
        let now = Utc::now();
        let idle_ms = idle.as_millis() as i64;
        let stale: Vec<Arc<SessionHandle>> = self
            .inner
            .bridge
            .sessions()
            .into_iter()
            .filter(|s| {
                !s.cli_connected()
                    && s.consumer_count() == 0
                    && (now - s.last_activity()).num_milliseconds() >= idle_ms
            })
            .collect();
        for session in stale {
            info!(target: "swb.manager", session_id = %session.id, "reaping idle session");
            let _ = self.delete_session(&session.id).await;
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.inner.registry.list().len())
            .finish_non_exhaustive()
    }
}
