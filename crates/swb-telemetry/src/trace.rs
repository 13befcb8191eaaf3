// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structured trace sink: one JSON line per call.
//!
//! Tracing here is for protocol forensics (slash passthrough decisions,
//! permission correlation), not for log-level diagnostics; that is what the
//! `tracing` crate targets are for.

use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Correlation fields attached to every trace record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceContext {
    /// Session the record belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// End-to-end trace identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Request identifier, for request/response pairs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Slash command under trace, with leading slash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Processing phase (e.g. `"dispatch"`, `"intercept"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Final outcome (e.g. `"success"`, `"empty_result"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl TraceContext {
    /// Context scoped to a session.
    #[must_use]
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    /// Set the trace id.
    #[must_use]
    pub fn trace_id(mut self, id: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self
    }

    /// Set the request id.
    #[must_use]
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Set the command.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Set the outcome.
    #[must_use]
    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }
}

/// A structured trace sink.
pub trait Tracer: Send + Sync {
    /// Record a trace event.
    fn send(&self, component: &str, message_type: &str, body: Value, ctx: &TraceContext);

    /// Record an error-severity trace event.
    fn error(&self, component: &str, message_type: &str, body: Value, ctx: &TraceContext);
}

/// A single captured trace record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    /// Emitting component.
    pub component: String,
    /// Record type within the component.
    pub message_type: String,
    /// Arbitrary structured body.
    pub body: Value,
    /// Correlation context.
    pub ctx: TraceContext,
    /// Whether this was recorded through [`Tracer::error`].
    pub is_error: bool,
}

/// Production tracer: emits one JSON line per record through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLineTracer;

impl JsonLineTracer {
    fn line(component: &str, message_type: &str, body: &Value, ctx: &TraceContext) -> String {
        serde_json::json!({
            "component": component,
            "message_type": message_type,
            "body": body,
            "ctx": ctx,
        })
        .to_string()
    }
}

impl Tracer for JsonLineTracer {
    fn send(&self, component: &str, message_type: &str, body: Value, ctx: &TraceContext) {
        tracing::info!(target: "swb.trace", "{}", Self::line(component, message_type, &body, ctx));
    }

    fn error(&self, component: &str, message_type: &str, body: Value, ctx: &TraceContext) {
        tracing::error!(target: "swb.trace", "{}", Self::line(component, message_type, &body, ctx));
    }
}

/// Test tracer that records every call for later inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    records: Arc<Mutex<Vec<TraceRecord>>>,
}

impl RecordingTracer {
    /// Create a new, empty recording tracer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record captured so far.
    #[must_use]
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().expect("tracer lock poisoned").clone()
    }

    /// Records filtered by message type.
    #[must_use]
    pub fn of_type(&self, message_type: &str) -> Vec<TraceRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.message_type == message_type)
            .collect()
    }
}

impl Tracer for RecordingTracer {
    fn send(&self, component: &str, message_type: &str, body: Value, ctx: &TraceContext) {
        self.records
            .lock()
            .expect("tracer lock poisoned")
            .push(TraceRecord {
                component: component.into(),
                message_type: message_type.into(),
                body,
                ctx: ctx.clone(),
                is_error: false,
            });
    }

    fn error(&self, component: &str, message_type: &str, body: Value, ctx: &TraceContext) {
        self.records
            .lock()
            .expect("tracer lock poisoned")
            .push(TraceRecord {
                component: component.into(),
                message_type: message_type.into(),
                body,
                ctx: ctx.clone(),
                is_error: true,
            });
    }
}
