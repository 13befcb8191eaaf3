// SPDX-License-Identifier: MIT OR Apache-2.0
//! Slash-passthrough correlation.
//!
//! When a slash command is forwarded to the backend, the reply is not a
//! single message: it is (potentially) an assistant text stream followed by
//! a result, or a native CLI echo of the command's output. This module owns
//! the pending queue and the two matching strategies; the connector feeds it
//! and broadcasts whatever it emits.

use serde_json::Value;
use std::collections::VecDeque;
use std::time::Instant;

use swb_core::{MessageType, UnifiedMessage};

/// Cap on the per-session stream buffer used by envelope matching.
pub const STREAM_BUFFER_CAP: usize = 50 * 1024;

/// A forwarded slash command awaiting its intercepted reply.
#[derive(Debug, Clone)]
pub struct PendingPassthrough {
    /// The command text, with leading slash.
    pub command: String,
    /// Consumer-supplied request id echoed back in the result frame.
    pub request_id: String,
    /// Trace correlation id.
    pub trace_id: String,
    /// When the command was forwarded.
    pub started_at: Instant,
}

/// Which rule matched a passthrough reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedPath {
    /// Rule 1: the adapter's raw user echo was claimed.
    InterceptedUserEcho,
    /// Rule 2: an assistant envelope with joined text.
    AssistantText,
    /// Rule 2: a result envelope with a non-empty `result` field.
    ResultField,
    /// Rule 2: empty result flushed the accumulated stream buffer.
    StreamBuffer,
    /// Nothing matched (error emission).
    None,
}

impl MatchedPath {
    /// Trace spelling.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InterceptedUserEcho => "intercepted_user_echo",
            Self::AssistantText => "assistant_text",
            Self::ResultField => "result_field",
            Self::StreamBuffer => "stream_buffer",
            Self::None => "none",
        }
    }
}

/// Terminal outcome of one passthrough, for the decision-summary trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughOutcome {
    /// A result frame was emitted.
    Success,
    /// The CLI echo was claimed directly.
    InterceptedUserEcho,
    /// The backend produced no output at all.
    EmptyResult,
    /// The backend stream died while the command was pending.
    BackendError,
}

impl PassthroughOutcome {
    /// Trace spelling.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::InterceptedUserEcho => "intercepted_user_echo",
            Self::EmptyResult => "empty_result",
            Self::BackendError => "backend_error",
        }
    }
}

/// What the queue wants broadcast for a completed passthrough.
#[derive(Debug, Clone)]
pub enum PassthroughEmission {
    /// Broadcast `slash_command_result`.
    Result {
        /// The completed entry.
        entry: PendingPassthrough,
        /// Rendered command output.
        content: String,
        /// Which rule matched.
        matched_path: MatchedPath,
        /// Outcome for the decision summary.
        outcome: PassthroughOutcome,
    },
    /// Broadcast `slash_command_error`.
    Error {
        /// The failed entry.
        entry: PendingPassthrough,
        /// Failure detail.
        error: String,
        /// Which rule matched (always [`MatchedPath::None`] today).
        matched_path: MatchedPath,
        /// Outcome for the decision summary.
        outcome: PassthroughOutcome,
    },
}

/// The per-session passthrough state: FIFO pending queue, stream buffer,
/// and echoes claimed by the raw handler awaiting pickup.
///
/// Lives behind a `std::sync::Mutex` so the adapter's synchronous echo
/// handler can consult it.
#[derive(Debug, Default)]
pub struct PassthroughQueue {
    pending: VecDeque<PendingPassthrough>,
    buffer: String,
    claims: Vec<PassthroughEmission>,
}

impl PassthroughQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a forwarded command.
    pub fn push(&mut self, entry: PendingPassthrough) {
        self.pending.push_back(entry);
    }

    /// Number of commands awaiting interception.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no commands are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Rule 1: offer a raw native user echo to the oldest pending entry.
    ///
    /// Returns `true` when claimed; the adapter must then suppress the echo
    /// from the canonical stream. The resulting emission is parked in the
    /// claims list for the connector to drain.
    pub fn claim_echo(&mut self, raw: &Value) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        let Some(content) = echo_text(raw) else {
            return false;
        };
        let entry = self.pending.pop_front().expect("checked non-empty");
        self.buffer.clear();
        self.claims.push(PassthroughEmission::Result {
            entry,
            content,
            matched_path: MatchedPath::InterceptedUserEcho,
            outcome: PassthroughOutcome::InterceptedUserEcho,
        });
        true
    }

    /// Drain emissions produced by [`claim_echo`](Self::claim_echo).
    pub fn take_claims(&mut self) -> Vec<PassthroughEmission> {
        std::mem::take(&mut self.claims)
    }

    /// Rule 2: feed one canonical message through envelope matching.
    ///
    /// The message itself still flows to consumers; this only decides
    /// whether it *also* completes the oldest pending passthrough.
    pub fn on_canonical(&mut self, msg: &UnifiedMessage) -> Option<PassthroughEmission> {
        if self.pending.is_empty() {
            return None;
        }
        match msg.kind {
            MessageType::StreamEvent => {
                if let Some(text) = delta_text(msg) {
                    let room = STREAM_BUFFER_CAP.saturating_sub(self.buffer.len());
                    if room > 0 {
                        let take = text
                            .char_indices()
                            .take_while(|(i, _)| *i < room)
                            .map(|(i, c)| i + c.len_utf8())
                            .last()
                            .unwrap_or(0);
                        self.buffer.push_str(&text[..take]);
                    }
                }
                None
            }

            MessageType::Assistant => {
                let content = msg.text_content();
                if content.is_empty() {
                    return None;
                }
                let entry = self.pending.pop_front()?;
                self.buffer.clear();
                Some(PassthroughEmission::Result {
                    entry,
                    content,
                    matched_path: MatchedPath::AssistantText,
                    outcome: PassthroughOutcome::Success,
                })
            }

            MessageType::Result => {
                let field = msg.meta_str("result").unwrap_or("").to_string();
                let entry = self.pending.pop_front()?;
                if !field.is_empty() {
                    self.buffer.clear();
                    Some(PassthroughEmission::Result {
                        entry,
                        content: field,
                        matched_path: MatchedPath::ResultField,
                        outcome: PassthroughOutcome::Success,
                    })
                } else if !self.buffer.is_empty() {
                    let content = std::mem::take(&mut self.buffer);
                    Some(PassthroughEmission::Result {
                        entry,
                        content,
                        matched_path: MatchedPath::StreamBuffer,
                        outcome: PassthroughOutcome::Success,
                    })
                } else {
                    Some(PassthroughEmission::Error {
                        error: format!(
                            "Pending passthrough \"{}\" produced empty output",
                            entry.command
                        ),
                        entry,
                        matched_path: MatchedPath::None,
                        outcome: PassthroughOutcome::EmptyResult,
                    })
                }
            }

            _ => None,
        }
    }

    /// Cancel everything (backend loss); returns the abandoned entries.
    pub fn cancel_all(&mut self) -> Vec<PendingPassthrough> {
        self.buffer.clear();
        self.claims.clear();
        self.pending.drain(..).collect()
    }
}

fn delta_text(msg: &UnifiedMessage) -> Option<&str> {
    let delta = msg.metadata.get("event")?.get("delta")?;
    if delta.get("type").and_then(Value::as_str) == Some("text_delta") {
        delta.get("text").and_then(Value::as_str)
    } else {
        None
    }
}

/// Extract the echoed text of a raw native user message, stripping a
/// `<local-command-stdout>` wrapper if present.
fn echo_text(raw: &Value) -> Option<String> {
    let content = raw.pointer("/message/content")?;
    let text = match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };
    let trimmed = text.trim();
    let unwrapped = trimmed
        .strip_prefix("<local-command-stdout>")
        .and_then(|rest| rest.strip_suffix("</local-command-stdout>"))
        .unwrap_or(trimmed);
    Some(unwrapped.trim().to_string())
}
