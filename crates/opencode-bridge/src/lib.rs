// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! opencode-bridge
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Native → canonical translation with per-part text assembly.
pub mod inbound;
/// Canonical → native translation.
pub mod outbound;
/// The bound session: SSE task + HTTP calls.
pub mod session;
/// Server-sent-events line parsing.
pub mod sse;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use swb_adapter::{
    AdapterCapabilities, AdapterError, Availability, BackendAdapter, BackendSession,
    ConnectOptions,
};

use crate::session::OpencodeBackendSession;

/// HTTP + SSE adapter attaching to a running opencode server.
pub struct OpencodeAdapter {
    base_url: String,
    http: reqwest::Client,
}

impl OpencodeAdapter {
    /// Attach to the server at `base_url` (no trailing slash).
    #[must_use]
    pub fn attach(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn create_backend_session(&self) -> Result<String, AdapterError> {
        let response = self
            .http
            .post(format!("{}/session", self.base_url))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| AdapterError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AdapterError::Connect(format!(
                "session create returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Connect(e.to_string()))?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Handshake("server reported no session id".into()))
    }
}

#[async_trait]
impl BackendAdapter for OpencodeAdapter {
    fn name(&self) -> &str {
        "opencode"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: false,
            availability: Availability::Local,
            teams: false,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Box<dyn BackendSession>, AdapterError> {
        let backend_id = match &opts.resume {
            Some(id) => id.clone(),
            None => self.create_backend_session().await?,
        };
        let session = OpencodeBackendSession::start(
            self.http.clone(),
            self.base_url.clone(),
            opts.session_id,
            backend_id,
            opts.cwd,
            opts.model,
        )
        .await;
        Ok(Box::new(session))
    }
}
