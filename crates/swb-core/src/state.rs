// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session-level derived state and the pure reducer that maintains it.
//!
//! The reducer is a pure function of (state, message). The bridge owns the
//! only mutable [`SessionState`] per session and calls [`reduce`] from the
//! single consumption-loop task, so no locking happens inside a session.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{MessageType, UnifiedMessage};

/// A slash command registered for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SlashCommandInfo {
    /// Command name, without the leading slash.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Argument hint shown in UIs, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_hint: Option<String>,
}

/// Git metadata resolved by the external git collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GitMetadata {
    /// Current branch name.
    pub branch: String,
    /// HEAD commit SHA.
    pub head_sha: String,
    /// Whether the worktree has uncommitted changes.
    pub dirty: bool,
}

/// Capability snapshot populated by the capabilities handshake.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct CapabilitySnapshot {
    /// Slash commands reported by the backend CLI.
    pub commands: Vec<SlashCommandInfo>,
    /// Models the backend can switch between (vendor-shaped).
    pub models: Vec<Value>,
    /// Account descriptor (vendor-shaped).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Value>,
}

/// Accumulated token counters for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct TokenUsage {
    /// Input (prompt) tokens consumed.
    pub input_tokens: u64,
    /// Output (completion) tokens produced.
    pub output_tokens: u64,
}

/// Session-level derived state, produced exclusively by [`reduce`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct SessionState {
    /// Current model identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Working directory the backend runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Tools the backend advertises.
    #[serde(default)]
    pub tools: Vec<String>,

    /// Current permission mode (vendor-shaped string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,

    /// Git metadata, when a resolver supplied it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitMetadata>,

    /// Accumulated cost in US dollars.
    #[serde(default)]
    pub total_cost_usd: f64,

    /// Accumulated token counters.
    #[serde(default)]
    pub usage: TokenUsage,

    /// Context window utilization percentage, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_percent: Option<f64>,

    /// Slash commands registered for this session.
    #[serde(default)]
    pub slash_commands: Vec<SlashCommandInfo>,

    /// MCP servers the backend is connected to.
    #[serde(default)]
    pub mcp_servers: Vec<String>,

    /// Skills the backend advertises.
    #[serde(default)]
    pub skills: Vec<String>,

    /// Capability snapshot from the capabilities handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilitySnapshot>,

    /// Last reported backend auth status (vendor-shaped string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_status: Option<String>,
}

impl SessionState {
    /// Attach externally resolved git metadata.
    pub fn set_git(&mut self, git: GitMetadata) {
        self.git = Some(git);
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn commands_list(value: Option<&Value>) -> Vec<SlashCommandInfo> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Fold one canonical message into the session state.
///
/// Pure: no IO, no clocks, no randomness. Unknown metadata shapes are
/// ignored rather than rejected.
pub fn reduce(state: &mut SessionState, msg: &UnifiedMessage) {
    match msg.kind {
        MessageType::SessionInit => {
            if let Some(model) = msg.meta_str("model") {
                state.model = Some(model.to_string());
            }
            if let Some(cwd) = msg.meta_str("cwd") {
                state.cwd = Some(cwd.to_string());
            }
            let tools = string_list(msg.metadata.get("tools"));
            if !tools.is_empty() {
                state.tools = tools;
            }
            if let Some(mode) = msg.meta_str("permissionMode") {
                state.permission_mode = Some(mode.to_string());
            }
            let servers = string_list(msg.metadata.get("mcp_servers"));
            if !servers.is_empty() {
                state.mcp_servers = servers;
            }
            let skills = string_list(msg.metadata.get("skills"));
            if !skills.is_empty() {
                state.skills = skills;
            }
            let commands = commands_list(msg.metadata.get("slash_commands"));
            if !commands.is_empty() {
                state.slash_commands = commands;
            }
        }

        MessageType::ConfigurationChange => {
            if let Some(model) = msg.meta_str("model") {
                state.model = Some(model.to_string());
            }
            if let Some(mode) = msg.meta_str("permissionMode") {
                state.permission_mode = Some(mode.to_string());
            }
            let commands = commands_list(msg.metadata.get("slash_commands"));
            if !commands.is_empty() {
                state.slash_commands = commands;
            }
        }

        MessageType::Result => {
            if let Some(cost) = msg.metadata.get("total_cost_usd").and_then(Value::as_f64) {
                state.total_cost_usd += cost;
            }
            if let Some(usage) = msg.metadata.get("usage") {
                if let Some(n) = usage.get("input_tokens").and_then(Value::as_u64) {
                    state.usage.input_tokens += n;
                }
                if let Some(n) = usage.get("output_tokens").and_then(Value::as_u64) {
                    state.usage.output_tokens += n;
                }
            }
            if let Some(pct) = msg.metadata.get("context_percent").and_then(Value::as_f64) {
                state.context_percent = Some(pct);
            }
        }

        MessageType::StatusChange => {
            if let Some(pct) = msg.metadata.get("context_percent").and_then(Value::as_f64) {
                state.context_percent = Some(pct);
            }
        }

        MessageType::ControlResponse => {
            if msg.meta_str("subtype") == Some("success")
                && let Some(response) = msg.metadata.get("response")
            {
                state.capabilities = Some(CapabilitySnapshot {
                    commands: commands_list(response.get("commands")),
                    models: response
                        .get("models")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default(),
                    account: response.get("account").cloned(),
                });
            }
        }

        MessageType::AuthStatus => {
            if let Some(status) = msg.meta_str("status") {
                state.auth_status = Some(status.to_string());
            }
        }

        // Everything else carries no session-state semantics.
        _ => {}
    }
}
