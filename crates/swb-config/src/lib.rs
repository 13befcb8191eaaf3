// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! swb-config
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A timer is unusually large.
    LargeTimer {
        /// Field name.
        field: &'static str,
        /// Configured value in milliseconds.
        ms: u64,
    },
    /// The idle reaper is disabled.
    IdleReaperDisabled,
    /// An adapter entry names a command that is a bare word with no path.
    BareAdapterCommand {
        /// Adapter name.
        adapter: String,
        /// The command as configured.
        command: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeTimer { field, ms } => {
                write!(f, "timer '{field}' is unusually large ({ms}ms)")
            }
            ConfigWarning::IdleReaperDisabled => {
                write!(f, "idle_session_timeout_ms <= 0: idle sessions are never reaped")
            }
            ConfigWarning::BareAdapterCommand { adapter, command } => {
                write!(
                    f,
                    "adapter '{adapter}' command '{command}' will be resolved via PATH"
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Per-adapter launch settings for subprocess-spawning adapters.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AdapterEntry {
    /// Command to spawn.
    pub command: String,
    /// Extra CLI arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the subprocess.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Top-level runtime configuration for the switchboard.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct SwitchboardConfig {
    /// TCP port the consumer transport listens on.
    pub port: u16,

    /// Default adapter when a session does not name one.
    pub default_adapter: String,

    /// Consumer authentication deadline.
    pub auth_timeout_ms: u64,

    /// Grace period for restored sessions to reattach before relaunch.
    pub reconnect_grace_period_ms: u64,

    /// Idle-session reap threshold. Non-positive disables the reaper.
    pub idle_session_timeout_ms: i64,

    /// Window during which repeated relaunch requests collapse to one.
    pub relaunch_dedup_ms: u64,

    /// Graceful-kill deadline before the forceful signal.
    pub kill_grace_period_ms: u64,

    /// Process exits faster than this count as crashes.
    pub crash_threshold_ms: u64,

    /// Quick crashes in a row before the circuit breaker opens.
    pub failure_threshold: u32,

    /// Capabilities handshake deadline.
    pub capabilities_timeout_ms: u64,

    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Named adapter launch definitions.
    pub adapters: BTreeMap<String, AdapterEntry>,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            port: 8799,
            default_adapter: "agent-sdk".into(),
            auth_timeout_ms: 5_000,
            reconnect_grace_period_ms: 15_000,
            idle_session_timeout_ms: 300_000,
            relaunch_dedup_ms: 5_000,
            kill_grace_period_ms: 5_000,
            crash_threshold_ms: 100,
            failure_threshold: 5,
            capabilities_timeout_ms: 10_000,
            log_level: Some("info".into()),
            adapters: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Timers above this threshold generate a warning (1 hour).
const LARGE_TIMER_THRESHOLD_MS: u64 = 3_600_000;

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`SwitchboardConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`SwitchboardConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
///
/// # Errors
///
/// Returns [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
pub fn load_config(path: Option<&Path>) -> Result<SwitchboardConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => SwitchboardConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`SwitchboardConfig`].
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] with the TOML diagnostic.
pub fn parse_toml(content: &str) -> Result<SwitchboardConfig, ConfigError> {
    toml::from_str::<SwitchboardConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `SWB_PORT`
/// - `SWB_DEFAULT_ADAPTER`
/// - `SWB_LOG_LEVEL`
pub fn apply_env_overrides(config: &mut SwitchboardConfig) {
    if let Ok(val) = std::env::var("SWB_PORT")
        && let Ok(port) = val.parse()
    {
        config.port = port;
    }
    if let Ok(val) = std::env::var("SWB_DEFAULT_ADAPTER") {
        config.default_adapter = val;
    }
    if let Ok(val) = std::env::var("SWB_LOG_LEVEL") {
        config.log_level = Some(val);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (bad log level, zero thresholds, empty adapter commands) come
/// back as [`ConfigError::ValidationError`]; soft issues as warnings.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] listing every hard failure.
pub fn validate_config(config: &SwitchboardConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }

    if config.failure_threshold == 0 {
        errors.push("failure_threshold must be at least 1".into());
    }
    if config.crash_threshold_ms == 0 {
        errors.push("crash_threshold_ms must be positive".into());
    }
    if config.default_adapter.is_empty() {
        errors.push("default_adapter must not be empty".into());
    }

    for (field, ms) in [
        ("auth_timeout_ms", config.auth_timeout_ms),
        ("reconnect_grace_period_ms", config.reconnect_grace_period_ms),
        ("relaunch_dedup_ms", config.relaunch_dedup_ms),
        ("kill_grace_period_ms", config.kill_grace_period_ms),
    ] {
        if ms == 0 {
            errors.push(format!("{field} must be positive"));
        } else if ms > LARGE_TIMER_THRESHOLD_MS {
            warnings.push(ConfigWarning::LargeTimer { field, ms });
        }
    }

    if config.idle_session_timeout_ms <= 0 {
        warnings.push(ConfigWarning::IdleReaperDisabled);
    }

    for (name, adapter) in &config.adapters {
        if name.is_empty() {
            errors.push("adapter name must not be empty".into());
        }
        if adapter.command.is_empty() {
            errors.push(format!("adapter '{name}' has an empty command"));
        } else if !adapter.command.contains('/') {
            warnings.push(ConfigWarning::BareAdapterCommand {
                adapter: name.clone(),
                command: adapter.command.clone(),
            });
        }
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}
