//! Server-side session registry
//!
//! The only cross-connection shared state: station_id → live session handle.
//! Inserted on accept (under a placeholder identity), rekeyed when
//! BootNotification reveals the real station ID, removed on close or
//! heartbeat eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::support::{OcppError, OcppMessage, OcppResult};

use super::pending::PendingRequests;

/// Instruction for a connection's processing task.
#[derive(Debug)]
pub enum Outbound {
    /// Transmit a raw frame.
    Frame(String),
    /// Close the transport and end the task.
    Close,
}

/// Live handle to one connection, shared across tasks.
pub struct SessionHandle {
    /// Registry-unique token identifying this connection, not its station.
    pub token: u64,
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub pending: Arc<PendingRequests>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Thread-safe registry of active charge point sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    next_token: AtomicU64,
}

/// Shared, reference-counted session registry.
pub type SharedSessionRegistry = Arc<SessionRegistry>;

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn shared() -> SharedSessionRegistry {
        Arc::new(Self::new())
    }

    /// Register a new session under `station_id`.
    ///
    /// Returns a registry-unique token for this connection. A reconnecting
    /// station replaces the previous entry; the returned token is what lets
    /// the replaced connection's cleanup leave the new entry alone.
    pub fn register(
        &self,
        station_id: &str,
        outbound: mpsc::UnboundedSender<Outbound>,
        pending: Arc<PendingRequests>,
    ) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        info!(station_id, token, "Registering session");
        let now = Utc::now();
        self.sessions.insert(
            station_id.to_string(),
            SessionHandle {
                token,
                outbound,
                pending,
                connected_at: now,
                last_heartbeat: now,
            },
        );
        token
    }

    /// Move a session from its placeholder identity to the real station ID
    /// revealed by BootNotification.
    ///
    /// Known limitation: remove+insert is not transactional, so two stations
    /// booting at the same instant could race on the same target key; the
    /// later insert wins, matching first-come-last-served on reconnect.
    pub fn rekey(&self, old_id: &str, new_id: &str) -> bool {
        if old_id == new_id {
            return true;
        }
        match self.sessions.remove(old_id) {
            Some((_, handle)) => {
                if self.sessions.contains_key(new_id) {
                    warn!(station_id = new_id, "Rekey replaces an existing session");
                }
                info!(old_id, new_id, "Rekeying session");
                self.sessions.insert(new_id.to_string(), handle);
                true
            }
            None => {
                warn!(old_id, "Rekey source not found");
                false
            }
        }
    }

    /// Remove a session, failing its pending requests.
    ///
    /// Only removes the entry if it still belongs to the connection that
    /// holds `token`. A task that was replaced by a reconnect finds a newer
    /// token under its station_id and must not tear that session down.
    pub fn unregister(&self, station_id: &str, token: u64) {
        if let Some((_, handle)) = self
            .sessions
            .remove_if(station_id, |_, handle| handle.token == token)
        {
            info!(station_id, token, "Unregistered session");
            handle
                .pending
                .fail_all(&OcppError::Connection("connection closed".into()));
        }
    }

    /// Evict a stale session: ask its task to close, then unregister.
    pub fn evict(&self, station_id: &str) {
        if let Some((_, handle)) = self.sessions.remove(station_id) {
            warn!(station_id, "Evicting stale session");
            let _ = handle.outbound.send(Outbound::Close);
            handle
                .pending
                .fail_all(&OcppError::Connection("session evicted".into()));
        }
    }

    /// Queue a raw frame for transmission to a specific charge point.
    pub fn send_frame(&self, station_id: &str, frame: String) -> OcppResult<()> {
        match self.sessions.get(station_id) {
            Some(handle) => handle
                .outbound
                .send(Outbound::Frame(frame))
                .map_err(|_| OcppError::Connection(format!("{} task stopped", station_id))),
            None => Err(OcppError::Connection(format!(
                "{} is not connected",
                station_id
            ))),
        }
    }

    /// Send a request-expecting Call and await the matched response.
    ///
    /// The pending entry is installed before the frame is queued, so a
    /// response cannot outrun its registration.
    pub async fn send_request(
        &self,
        station_id: &str,
        action: &str,
        payload: Value,
        deadline: Duration,
    ) -> OcppResult<Value> {
        let (pending, unique_id, receiver, frame) = {
            let handle = self.sessions.get(station_id).ok_or_else(|| {
                OcppError::Connection(format!("{} is not connected", station_id))
            })?;
            let message = OcppMessage::call(action, payload);
            let receiver = handle.pending.register(&message.unique_id, action);
            (
                handle.pending.clone(),
                message.unique_id.clone(),
                receiver,
                message.encode(),
            )
        };

        info!(station_id, action, unique_id = unique_id.as_str(), "Sending request");
        if let Err(e) = self.send_frame(station_id, frame) {
            pending.abandon(&unique_id);
            return Err(e);
        }

        pending.wait(&unique_id, receiver, deadline).await
    }

    /// Update a session's last-heartbeat stamp (monotonic).
    pub fn touch_heartbeat(&self, station_id: &str) {
        if let Some(mut handle) = self.sessions.get_mut(station_id) {
            let now = Utc::now();
            if now > handle.last_heartbeat {
                handle.last_heartbeat = now;
            }
        }
    }

    pub fn is_connected(&self, station_id: &str) -> bool {
        self.sessions.contains_key(station_id)
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Test hook: shift a session's last-heartbeat stamp into the past.
    #[cfg(test)]
    pub(crate) fn backdate_heartbeat(&self, station_id: &str, by: chrono::Duration) {
        if let Some(mut handle) = self.sessions.get_mut(station_id) {
            handle.last_heartbeat = Utc::now() - by;
        }
    }

    /// Snapshot of (station_id, last_heartbeat) for the heartbeat monitor.
    pub fn heartbeat_snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        self.sessions
            .iter()
            .map(|e| (e.key().clone(), e.last_heartbeat))
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register_session(
        registry: &SessionRegistry,
        id: &str,
    ) -> (mpsc::UnboundedReceiver<Outbound>, Arc<PendingRequests>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingRequests::new());
        registry.register(id, tx, pending.clone());
        (rx, pending)
    }

    #[test]
    fn register_and_lookup() {
        let registry = SessionRegistry::new();
        let (_rx, _) = register_session(&registry, "CP001");
        assert!(registry.is_connected("CP001"));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn rekey_moves_handle() {
        let registry = SessionRegistry::new();
        let (mut rx, _) = register_session(&registry, "PENDING-1");
        assert!(registry.rekey("PENDING-1", "CP001"));
        assert!(!registry.is_connected("PENDING-1"));
        assert!(registry.is_connected("CP001"));

        registry.send_frame("CP001", "hello".into()).unwrap();
        match rx.try_recv().unwrap() {
            Outbound::Frame(f) => assert_eq!(f, "hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rekey_preserves_the_connection_token() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let token = registry.register("PENDING-1", tx, Arc::new(PendingRequests::new()));
        assert!(registry.rekey("PENDING-1", "CP001"));
        registry.unregister("CP001", token);
        assert!(!registry.is_connected("CP001"));
    }

    #[test]
    fn stale_unregister_leaves_replacement_session_alone() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let old_token = registry.register("CP001", tx1, Arc::new(PendingRequests::new()));

        // Reconnect replaces the entry under the same station ID.
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let pending2 = Arc::new(PendingRequests::new());
        let new_token = registry.register("CP001", tx2, pending2.clone());
        let _waiting = pending2.register("req-1", "Reset");

        // The replaced connection's cleanup must be a no-op.
        registry.unregister("CP001", old_token);
        assert!(registry.is_connected("CP001"));
        assert_eq!(pending2.len(), 1);

        registry.unregister("CP001", new_token);
        assert!(!registry.is_connected("CP001"));
        assert!(pending2.is_empty());
    }

    #[test]
    fn rekey_unknown_source_fails() {
        let registry = SessionRegistry::new();
        assert!(!registry.rekey("nope", "CP001"));
    }

    #[test]
    fn evict_sends_close_and_fails_pending() {
        let registry = SessionRegistry::new();
        let (mut rx, pending) = register_session(&registry, "CP001");
        let _receiver = pending.register("req-1", "Authorize");

        registry.evict("CP001");
        assert!(!registry.is_connected("CP001"));
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn send_request_resolves_via_pending_table() {
        let registry = SessionRegistry::new();
        let (mut rx, pending) = register_session(&registry, "CP001");

        // Run the request concurrently with a scripted responder.
        let registry = Arc::new(registry);
        let requester = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .send_request("CP001", "Reset", json!({"type": "Immediate"}), Duration::from_secs(1))
                    .await
            })
        };

        // Receive the outbound frame and answer it.
        let frame = match rx.recv().await.unwrap() {
            Outbound::Frame(f) => f,
            other => panic!("unexpected {:?}", other),
        };
        let call = OcppMessage::decode(&frame).unwrap();
        assert_eq!(call.action.as_deref(), Some("Reset"));
        pending.resolve(&call.unique_id, Ok(json!({"status": "Accepted"})));

        let response = requester.await.unwrap().unwrap();
        assert_eq!(response["status"], "Accepted");
    }

    #[tokio::test]
    async fn send_request_to_unknown_station_fails_fast() {
        let registry = SessionRegistry::new();
        let err = registry
            .send_request("ghost", "Reset", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OcppError::Connection(_)));
    }
}
