// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! swb-manager
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Launcher bookkeeping for subprocess-spawning adapters.
pub mod launcher;
/// The composition root.
pub mod manager;
/// The persistent session registry.
pub mod registry;
/// Storage contracts and implementations.
pub mod storage;

pub use launcher::{Launcher, LauncherSessionInfo, LauncherSessionState};
pub use manager::{
    CreateSessionOptions, ManagerError, SessionManager, SessionOverview, Transport,
};
pub use registry::SessionRegistry;
pub use storage::{
    FileLauncherStateStorage, FileSessionStorage, InMemoryLauncherStateStorage,
    InMemorySessionStorage, LauncherStateStorage, RegistrySessionState, SessionRecord,
    SessionStorage, StorageError,
};
