// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! sdk-bridge
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The in-process query contract.
pub mod query;
/// The in-process Agent SDK driver.
pub mod sdk;
/// Native ↔ canonical translation shared by both drivers.
pub mod translate;
/// The raw NDJSON forwarding driver.
pub mod url;

pub use query::{CanUseTool, PermissionDecision, QueryFn, QueryHandle, QueryOptions, ToolUseContext};
pub use sdk::AgentSdkAdapter;
pub use url::UrlForwardAdapter;
