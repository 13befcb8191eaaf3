// SPDX-License-Identifier: MIT OR Apache-2.0
//! Slash-command registry and local execution.
//!
//! Shared across sessions: CLI-reported commands may arrive concurrently
//! from several capability handshakes, so the table sits behind a lock.

use std::collections::HashMap;
use std::sync::Mutex;

use swb_core::state::SessionState;

/// Where a command definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    /// Seeded by the broker itself.
    BuiltIn,
    /// Reported by the backend CLI's capabilities handshake.
    Cli,
    /// Promoted or registered as a skill.
    Skill,
}

/// How a command is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRouting {
    /// Handled locally against session state; never touches the backend.
    Consumer,
    /// Forwarded to the backend as a user message, reply intercepted.
    Passthrough,
}

/// One registered slash command.
#[derive(Debug, Clone)]
pub struct SlashCommand {
    /// Name without the leading slash.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Definition origin.
    pub source: CommandSource,
    /// Routing category.
    pub routing: CommandRouting,
}

/// Thread-safe slash-command registry shared across sessions.
#[derive(Debug)]
pub struct SlashRegistry {
    commands: Mutex<HashMap<String, SlashCommand>>,
}

impl SlashRegistry {
    /// Create a registry seeded with the built-in command set.
    #[must_use]
    pub fn new() -> Self {
        let mut commands = HashMap::new();
        for (name, description) in [
            ("help", "List available commands"),
            ("clear", "Clear the conversation display"),
            ("status", "Show session status"),
        ] {
            commands.insert(
                name.to_string(),
                SlashCommand {
                    name: name.to_string(),
                    description: description.to_string(),
                    source: CommandSource::BuiltIn,
                    routing: CommandRouting::Consumer,
                },
            );
        }
        Self {
            commands: Mutex::new(commands),
        }
    }

    /// Look up a command by name (no leading slash).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<SlashCommand> {
        self.commands
            .lock()
            .expect("slash registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// All registered commands, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<SlashCommand> {
        let mut commands: Vec<SlashCommand> = self
            .commands
            .lock()
            .expect("slash registry lock poisoned")
            .values()
            .cloned()
            .collect();
        commands.sort_by(|a, b| a.name.cmp(&b.name));
        commands
    }

    /// Merge CLI-reported commands from a capabilities handshake.
    ///
    /// Existing built-ins keep their routing but gain the CLI's description;
    /// new names register as source `cli`, routed passthrough.
    pub fn register_from_cli<I>(&self, commands: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut table = self.commands.lock().expect("slash registry lock poisoned");
        for (name, description) in commands {
            match table.get_mut(&name) {
                Some(existing) => {
                    if !description.is_empty() {
                        existing.description = description;
                    }
                }
                None => {
                    table.insert(
                        name.clone(),
                        SlashCommand {
                            name,
                            description,
                            source: CommandSource::Cli,
                            routing: CommandRouting::Passthrough,
                        },
                    );
                }
            }
        }
    }

    /// Register skill commands: existing `cli` entries are promoted, new
    /// names inserted as skills routed passthrough.
    pub fn register_skills<I>(&self, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut table = self.commands.lock().expect("slash registry lock poisoned");
        for name in names {
            match table.get_mut(&name) {
                Some(existing) => {
                    if existing.source == CommandSource::Cli {
                        existing.source = CommandSource::Skill;
                    }
                }
                None => {
                    table.insert(
                        name.clone(),
                        SlashCommand {
                            name,
                            description: String::new(),
                            source: CommandSource::Skill,
                            routing: CommandRouting::Passthrough,
                        },
                    );
                }
            }
        }
    }

    /// Drop everything that is not built-in.
    pub fn clear_dynamic(&self) {
        self.commands
            .lock()
            .expect("slash registry lock poisoned")
            .retain(|_, c| c.source == CommandSource::BuiltIn);
    }

    /// Execute a consumer-routed command against session state.
    ///
    /// # Errors
    ///
    /// Returns a human-readable error string for unknown or non-local
    /// commands.
    pub fn execute_local(&self, name: &str, state: &SessionState) -> Result<String, String> {
        let command = self
            .get(name)
            .ok_or_else(|| format!("unknown command /{name}"))?;
        if command.routing != CommandRouting::Consumer {
            return Err(format!("/{name} is not a local command"));
        }
        match name {
            "help" => {
                let lines: Vec<String> = self
                    .list()
                    .into_iter()
                    .map(|c| {
                        if c.description.is_empty() {
                            format!("/{}", c.name)
                        } else {
                            format!("/{} — {}", c.name, c.description)
                        }
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
            "clear" => Ok("Conversation display cleared".to_string()),
            "status" => {
                let mut lines = Vec::new();
                lines.push(format!(
                    "model: {}",
                    state.model.as_deref().unwrap_or("unknown")
                ));
                lines.push(format!("cwd: {}", state.cwd.as_deref().unwrap_or("unknown")));
                lines.push(format!(
                    "tokens: {} in / {} out",
                    state.usage.input_tokens, state.usage.output_tokens
                ));
                lines.push(format!("cost: ${:.4}", state.total_cost_usd));
                if let Some(pct) = state.context_percent {
                    lines.push(format!("context: {pct:.0}%"));
                }
                Ok(lines.join("\n"))
            }
            other => Err(format!("no local handler for /{other}")),
        }
    }
}

impl Default for SlashRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip the leading slash and any arguments from a command line.
#[must_use]
pub fn command_name(command: &str) -> &str {
    let trimmed = command.trim().trim_start_matches('/');
    trimmed.split_whitespace().next().unwrap_or("")
}
