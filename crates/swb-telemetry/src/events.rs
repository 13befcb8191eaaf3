// SPDX-License-Identifier: MIT OR Apache-2.0
//! The broker event taxonomy emitted to the metrics/management plane.

use serde::{Deserialize, Serialize};

/// An event emitted by the core to the metrics/management plane.
///
/// Wire names use the `domain:event` convention, so variants carry explicit
/// serde renames rather than a `rename_all` rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// A backend session was bound to a session.
    #[serde(rename = "backend:connected")]
    BackendConnected {
        /// Session identifier.
        session_id: String,
        /// Adapter that produced the backend session.
        adapter: String,
    },

    /// The backend session ended or was torn down.
    #[serde(rename = "backend:disconnected")]
    BackendDisconnected {
        /// Session identifier.
        session_id: String,
    },

    /// A canonical message arrived from the backend.
    #[serde(rename = "backend:message")]
    BackendMessage {
        /// Session identifier.
        session_id: String,
        /// Canonical type of the message (wire spelling).
        message_type: String,
    },

    /// The backend reported its own session identifier.
    #[serde(rename = "backend:session_id")]
    BackendSessionId {
        /// Session identifier.
        session_id: String,
        /// Backend-assigned identifier used for resume.
        backend_session_id: String,
    },

    /// A session lost its backend and wants a relaunch.
    #[serde(rename = "backend:relaunch_needed")]
    BackendRelaunchNeeded {
        /// Session identifier.
        session_id: String,
    },

    /// A subprocess was spawned.
    #[serde(rename = "process:spawned")]
    ProcessSpawned {
        /// Session identifier.
        session_id: String,
        /// OS process id, if the platform reported one.
        pid: Option<u32>,
    },

    /// A subprocess exited.
    #[serde(rename = "process:exited")]
    ProcessExited {
        /// Session identifier.
        session_id: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Wall-clock lifetime of the process.
        uptime_ms: u64,
        /// Circuit breaker state after recording this exit.
        circuit_breaker: String,
    },

    /// A line arrived on a subprocess's stdout.
    #[serde(rename = "process:stdout")]
    ProcessStdout {
        /// Session identifier.
        session_id: String,
        /// Trimmed, non-empty line.
        line: String,
    },

    /// A line arrived on a subprocess's stderr.
    #[serde(rename = "process:stderr")]
    ProcessStderr {
        /// Session identifier.
        session_id: String,
        /// Trimmed, non-empty line.
        line: String,
    },

    /// A consumer socket authenticated.
    #[serde(rename = "consumer:authenticated")]
    ConsumerAuthenticated {
        /// Session identifier.
        session_id: String,
        /// Granted role (`participant` or `observer`).
        role: String,
    },

    /// A consumer socket failed authentication.
    #[serde(rename = "consumer:auth_failed")]
    ConsumerAuthFailed {
        /// Session identifier.
        session_id: String,
        /// Failure detail.
        reason: String,
    },

    /// The backend asked for a tool permission.
    #[serde(rename = "permission:requested")]
    PermissionRequested {
        /// Session identifier.
        session_id: String,
        /// Correlation id of the request.
        request_id: String,
        /// Tool the backend wants to run.
        tool_name: String,
    },

    /// A permission request was answered or cancelled.
    #[serde(rename = "permission:resolved")]
    PermissionResolved {
        /// Session identifier.
        session_id: String,
        /// Correlation id of the request.
        request_id: String,
        /// Resolution (`allow`, `deny`, `cancelled`, ...).
        behavior: String,
    },

    /// A slash command completed.
    #[serde(rename = "slash_command:executed")]
    SlashCommandExecuted {
        /// Session identifier.
        session_id: String,
        /// The command, with leading slash.
        command: String,
        /// Wall-clock execution time.
        duration_ms: u64,
    },

    /// A slash command failed.
    #[serde(rename = "slash_command:failed")]
    SlashCommandFailed {
        /// Session identifier.
        session_id: String,
        /// The command, with leading slash.
        command: String,
        /// Failure detail.
        error: String,
    },

    /// The capabilities handshake completed.
    #[serde(rename = "capabilities:ready")]
    CapabilitiesReady {
        /// Session identifier.
        session_id: String,
    },

    /// The capabilities handshake timed out.
    #[serde(rename = "capabilities:timeout")]
    CapabilitiesTimeout {
        /// Session identifier.
        session_id: String,
    },

    /// The backend reported an authentication status change.
    #[serde(rename = "auth_status")]
    AuthStatus {
        /// Session identifier.
        session_id: String,
        /// Vendor-shaped status string.
        status: String,
    },

    /// A session reached its terminal state.
    #[serde(rename = "session:closed")]
    SessionClosed {
        /// Session identifier.
        session_id: String,
    },

    /// A recoverable error surfaced to the management plane.
    #[serde(rename = "error")]
    Error {
        /// Session identifier, when the error is session-scoped.
        session_id: Option<String>,
        /// Component that raised the error (e.g. `"acp:spawn"`).
        source: String,
        /// Human-readable detail.
        message: String,
    },
}

impl BrokerEvent {
    /// The wire name of this event (`domain:event` convention).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::BackendConnected { .. } => "backend:connected",
            Self::BackendDisconnected { .. } => "backend:disconnected",
            Self::BackendMessage { .. } => "backend:message",
            Self::BackendSessionId { .. } => "backend:session_id",
            Self::BackendRelaunchNeeded { .. } => "backend:relaunch_needed",
            Self::ProcessSpawned { .. } => "process:spawned",
            Self::ProcessExited { .. } => "process:exited",
            Self::ProcessStdout { .. } => "process:stdout",
            Self::ProcessStderr { .. } => "process:stderr",
            Self::ConsumerAuthenticated { .. } => "consumer:authenticated",
            Self::ConsumerAuthFailed { .. } => "consumer:auth_failed",
            Self::PermissionRequested { .. } => "permission:requested",
            Self::PermissionResolved { .. } => "permission:resolved",
            Self::SlashCommandExecuted { .. } => "slash_command:executed",
            Self::SlashCommandFailed { .. } => "slash_command:failed",
            Self::CapabilitiesReady { .. } => "capabilities:ready",
            Self::CapabilitiesTimeout { .. } => "capabilities:timeout",
            Self::AuthStatus { .. } => "auth_status",
            Self::SessionClosed { .. } => "session:closed",
            Self::Error { .. } => "error",
        }
    }

    /// The session this event is scoped to, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::BackendConnected { session_id, .. }
            | Self::BackendDisconnected { session_id }
            | Self::BackendMessage { session_id, .. }
            | Self::BackendSessionId { session_id, .. }
            | Self::BackendRelaunchNeeded { session_id }
            | Self::ProcessSpawned { session_id, .. }
            | Self::ProcessExited { session_id, .. }
            | Self::ProcessStdout { session_id, .. }
            | Self::ProcessStderr { session_id, .. }
            | Self::ConsumerAuthenticated { session_id, .. }
            | Self::ConsumerAuthFailed { session_id, .. }
            | Self::PermissionRequested { session_id, .. }
            | Self::PermissionResolved { session_id, .. }
            | Self::SlashCommandExecuted { session_id, .. }
            | Self::SlashCommandFailed { session_id, .. }
            | Self::CapabilitiesReady { session_id }
            | Self::CapabilitiesTimeout { session_id }
            | Self::AuthStatus { session_id, .. }
            | Self::SessionClosed { session_id } => Some(session_id),
            Self::Error { session_id, .. } => session_id.as_deref(),
        }
    }
}
