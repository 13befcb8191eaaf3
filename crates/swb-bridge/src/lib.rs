// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! swb-bridge
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The bridge proper: session table, consumer handlers, slash dispatch.
pub mod bridge;
/// Cooperative cancellation for consumption loops.
pub mod cancel;
/// The backend connector and consumption loop.
pub mod connector;
/// Sockets, identities, authentication.
pub mod consumer;
/// Bridge-originated consumer frames.
pub mod frames;
/// Slash-passthrough correlation.
pub mod passthrough;
/// The session entity.
pub mod session;
/// Slash-command registry and local execution.
pub mod slash;

pub use bridge::{BridgeConfig, BridgeError, SessionBridge};
pub use cancel::CancelToken;
pub use connector::{ConnectBackendOptions, control_request_message};
pub use consumer::{
    AuthContext, AuthError, Authenticator, CLOSE_AUTH_FAILED, ConsumerRole, ConsumerSocket,
    Identity,
};
pub use passthrough::{
    MatchedPath, PassthroughEmission, PassthroughOutcome, PassthroughQueue, PendingPassthrough,
    STREAM_BUFFER_CAP,
};
pub use session::{ConsumerEntry, SessionCore, SessionHandle};
pub use slash::{CommandRouting, CommandSource, SlashCommand, SlashRegistry};
