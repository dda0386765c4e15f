//! Action dispatch table
//!
//! Maps inbound Call actions to handlers. The bulk of real-world actions
//! collapse to one shared Accepted-shaped reply; the interesting ones get a
//! real handler. Handlers may mutate the session but must not block the
//! processing task unboundedly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::session::SessionState;
use crate::support::{OcppError, OcppResult};

/// A registered capability for one action name.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, payload: Value, session: &mut SessionState) -> OcppResult<Value>;
}

/// Inbound action name → handler.
pub struct DispatchTable {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action.into(), handler);
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Execute the handler for `action`. Unknown actions yield
    /// [`OcppError::NotSupported`], which the caller turns into a CallError
    /// reply without touching the connection.
    pub async fn dispatch(
        &self,
        action: &str,
        payload: Value,
        session: &mut SessionState,
    ) -> OcppResult<Value> {
        match self.handlers.get(action) {
            Some(handler) => handler.execute(payload, session).await,
            None => Err(OcppError::NotSupported(action.to_string())),
        }
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared stub handler: replies `{"status": "Accepted"}` regardless of payload.
pub struct AcceptAll;

#[async_trait]
impl ActionHandler for AcceptAll {
    async fn execute(&self, _payload: Value, _session: &mut SessionState) -> OcppResult<Value> {
        Ok(json!({"status": "Accepted"}))
    }
}

/// Stub handler replying with a fixed payload shape.
pub struct StaticReply(pub Value);

#[async_trait]
impl ActionHandler for StaticReply {
    async fn execute(&self, _payload: Value, _session: &mut SessionState) -> OcppResult<Value> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingHandler;

    #[async_trait]
    impl ActionHandler for FailingHandler {
        async fn execute(&self, _payload: Value, _session: &mut SessionState) -> OcppResult<Value> {
            Err(OcppError::Internal("handler blew up".into()))
        }
    }

    struct ConnectorMarker;

    #[async_trait]
    impl ActionHandler for ConnectorMarker {
        async fn execute(&self, payload: Value, session: &mut SessionState) -> OcppResult<Value> {
            let evse = payload["evseId"].as_u64().unwrap_or(0) as u32;
            session.update_connector(evse, 1, "Faulted", None);
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn unknown_action_is_not_supported() {
        let table = DispatchTable::new();
        let mut session = SessionState::new("CP001");
        let err = table
            .dispatch("Frobnicate", json!({}), &mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, OcppError::NotSupported(_)));
        assert_eq!(err.error_code(), "NotSupportedError");
    }

    #[tokio::test]
    async fn accept_all_replies_accepted() {
        let mut table = DispatchTable::new();
        table.register("UpdateFirmware", Arc::new(AcceptAll));
        let mut session = SessionState::new("CP001");
        let reply = table
            .dispatch("UpdateFirmware", json!({"location": "ftp://x"}), &mut session)
            .await
            .unwrap();
        assert_eq!(reply["status"], "Accepted");
    }

    #[tokio::test]
    async fn handlers_can_mutate_session() {
        let mut table = DispatchTable::new();
        table.register("MarkFaulted", Arc::new(ConnectorMarker));
        let mut session = SessionState::new("CP001");
        table
            .dispatch("MarkFaulted", json!({"evseId": 2}), &mut session)
            .await
            .unwrap();
        assert_eq!(session.connectors[&(2, 1)].status, "Faulted");
    }

    #[tokio::test]
    async fn handler_errors_propagate_without_panicking() {
        let mut table = DispatchTable::new();
        table.register("Boom", Arc::new(FailingHandler));
        let mut session = SessionState::new("CP001");
        let err = table.dispatch("Boom", json!({}), &mut session).await.unwrap_err();
        assert_eq!(err.error_code(), "InternalError");
    }
}
