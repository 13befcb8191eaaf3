// SPDX-License-Identifier: MIT OR Apache-2.0
//! The consumer plane: sockets, identities, authentication, fan-out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Consumer role; the sole access-control key on the inbound side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerRole {
    /// Full read/write access to the session.
    Participant,
    /// Read-only; may send `presence_query` and nothing else.
    Observer,
}

impl ConsumerRole {
    /// Wire spelling.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Participant => "participant",
            Self::Observer => "observer",
        }
    }
}

/// An authenticated consumer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject (user id, token subject, or anonymous handle).
    pub subject: String,
    /// Granted role.
    pub role: ConsumerRole,
}

impl Identity {
    /// Anonymous participant identity used in dev mode.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            subject: format!("anon-{}", uuid::Uuid::new_v4()),
            role: ConsumerRole::Participant,
        }
    }
}

/// Transport context handed to the authenticator.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// Session the socket wants to join.
    pub session_id: String,
    /// Transport headers.
    pub headers: BTreeMap<String, String>,
    /// Query parameters.
    pub query: BTreeMap<String, String>,
}

/// Authentication failure.
#[derive(Debug, thiserror::Error)]
#[error("authentication rejected: {0}")]
pub struct AuthError(pub String);

/// External authenticator collaborator.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate a consumer connection attempt.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the credentials are rejected.
    async fn authenticate(&self, ctx: &AuthContext) -> Result<Identity, AuthError>;
}

/// A user-facing socket, as the transport exposes it.
///
/// Sends are non-blocking: the transport buffers or drops.
pub trait ConsumerSocket: Send + Sync {
    /// Stable socket identifier within the process.
    fn id(&self) -> &str;

    /// Queue a text payload for delivery.
    fn send(&self, payload: &str);

    /// Close with a code and reason.
    fn close(&self, code: u16, reason: &str);
}

/// Close code for authentication failures.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
