// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-bridge
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Pluggable RPC-error classification.
pub mod classify;
/// The stdio driver: spawn, handshake, reader task, session.
pub mod client;
/// Line-delimited JSON-RPC codec.
pub mod codec;
/// Native → canonical translation.
pub mod inbound;
/// Canonical → native translation.
pub mod outbound;

use async_trait::async_trait;
use std::sync::Arc;

use swb_adapter::{
    AdapterCapabilities, AdapterError, Availability, BackendAdapter, BackendSession,
    ConnectOptions,
};
use swb_supervisor::{ProcessSpec, ProcessSupervisor};

use crate::classify::{AcpClassifier, CodexClassifier, ErrorClassifier, GeminiClassifier};
use crate::client::RpcBackendSession;

/// A JSON-RPC-over-stdio adapter profile.
///
/// `acp`, `gemini`, and `codex` share this driver; they differ in the binary
/// they launch and the error classifier they carry.
pub struct JsonRpcAdapter {
    name: String,
    supervisor: Arc<ProcessSupervisor>,
    spec: ProcessSpec,
    classifier: Arc<dyn ErrorClassifier>,
}

impl JsonRpcAdapter {
    /// The reference ACP profile.
    #[must_use]
    pub fn acp(supervisor: Arc<ProcessSupervisor>, spec: ProcessSpec) -> Self {
        Self {
            name: "acp".into(),
            supervisor,
            spec,
            classifier: Arc::new(AcpClassifier),
        }
    }

    /// The Gemini CLI profile.
    #[must_use]
    pub fn gemini(supervisor: Arc<ProcessSupervisor>, spec: ProcessSpec) -> Self {
        Self {
            name: "gemini".into(),
            supervisor,
            spec,
            classifier: Arc::new(GeminiClassifier),
        }
    }

    /// The Codex CLI profile.
    #[must_use]
    pub fn codex(supervisor: Arc<ProcessSupervisor>, spec: ProcessSpec) -> Self {
        Self {
            name: "codex".into(),
            supervisor,
            spec,
            classifier: Arc::new(CodexClassifier),
        }
    }

    /// Override the error classifier (custom deployments).
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }
}

#[async_trait]
impl BackendAdapter for JsonRpcAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
            availability: Availability::Local,
            teams: false,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Box<dyn BackendSession>, AdapterError> {
        let session = RpcBackendSession::establish(
            Arc::clone(&self.supervisor),
            self.spec.clone(),
            Arc::clone(&self.classifier),
            opts,
        )
        .await?;
        Ok(Box::new(session))
    }
}
