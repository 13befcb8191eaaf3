// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared test doubles for bridge integration tests.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use swb_bridge::{AuthContext, AuthError, Authenticator, ConsumerSocket, Identity};

/// A consumer socket that records everything.
pub struct TestSocket {
    id: String,
    sent: Mutex<Vec<Value>>,
    closed: Mutex<Option<(u16, String)>>,
}

impl TestSocket {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
        })
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn frames_of_type(&self, frame_type: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|v| v.get("type").and_then(Value::as_str) == Some(frame_type))
            .collect()
    }

    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.closed.lock().unwrap().clone()
    }
}

impl ConsumerSocket for TestSocket {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, payload: &str) {
        if let Ok(v) = serde_json::from_str(payload) {
            self.sent.lock().unwrap().push(v);
        }
    }

    fn close(&self, code: u16, reason: &str) {
        *self.closed.lock().unwrap() = Some((code, reason.to_string()));
    }
}

/// Authenticator handing out a fixed identity.
pub struct StaticAuth {
    pub identity: Identity,
}

#[async_trait::async_trait]
impl Authenticator for StaticAuth {
    async fn authenticate(&self, _ctx: &AuthContext) -> Result<Identity, AuthError> {
        Ok(self.identity.clone())
    }
}

/// Authenticator granting the role named in the `role` query parameter.
pub struct QueryRoleAuth;

#[async_trait::async_trait]
impl Authenticator for QueryRoleAuth {
    async fn authenticate(&self, ctx: &AuthContext) -> Result<Identity, AuthError> {
        let role = match ctx.query.get("role").map(String::as_str) {
            Some("observer") => swb_bridge::ConsumerRole::Observer,
            _ => swb_bridge::ConsumerRole::Participant,
        };
        Ok(Identity {
            subject: format!("{role:?}").to_lowercase(),
            role,
        })
    }
}

/// Auth context asking for the given role.
pub fn auth_as(role: &str) -> AuthContext {
    let mut ctx = AuthContext::default();
    ctx.query.insert("role".into(), role.into());
    ctx
}

/// Authenticator that never answers (timeout tests).
pub struct StallingAuth;

#[async_trait::async_trait]
impl Authenticator for StallingAuth {
    async fn authenticate(&self, _ctx: &AuthContext) -> Result<Identity, AuthError> {
        std::future::pending().await
    }
}

/// Poll until `check` passes or the deadline expires.
pub async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within bound"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
