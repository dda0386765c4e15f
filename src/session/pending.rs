//! Pending-request correlation table
//!
//! Every request-expecting Call gets exactly one entry here before it is
//! transmitted, and exactly one outcome: a matching CallResult, a matching
//! CallError, a timeout, or a connection-closed failure. Entries are removed
//! on resolution, so a second resolution attempt is a no-op and late
//! responses are dropped with a warning.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::support::{OcppError, OcppResult};

struct PendingEntry {
    action: String,
    sent_at: Instant,
    responder: oneshot::Sender<OcppResult<Value>>,
}

/// Per-connection correlation table: unique_id → awaiting handle.
pub struct PendingRequests {
    entries: DashMap<String, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Install an awaiting handle for `unique_id`.
    ///
    /// Must be called before the Call is transmitted, so a response arriving
    /// immediately still finds its entry.
    pub fn register(
        &self,
        unique_id: &str,
        action: &str,
    ) -> oneshot::Receiver<OcppResult<Value>> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            unique_id.to_string(),
            PendingEntry {
                action: action.to_string(),
                sent_at: Instant::now(),
                responder: tx,
            },
        );
        rx
    }

    /// Fulfill the handle for `unique_id`, if one is still registered.
    ///
    /// Unknown ids (stray or late responses) are logged and ignored.
    pub fn resolve(&self, unique_id: &str, outcome: OcppResult<Value>) {
        match self.entries.remove(unique_id) {
            Some((_, entry)) => {
                debug!(
                    unique_id,
                    action = entry.action.as_str(),
                    elapsed_ms = entry.sent_at.elapsed().as_millis() as u64,
                    "Resolving pending request"
                );
                // Receiver may have given up already; that is fine.
                let _ = entry.responder.send(outcome);
            }
            None => {
                warn!(unique_id, "Dropping response for unknown or expired request");
            }
        }
    }

    /// Remove a registration that will never get a response (send failed).
    pub fn abandon(&self, unique_id: &str) {
        self.entries.remove(unique_id);
    }

    /// Await the outcome for a registered request.
    ///
    /// On expiry the entry is removed and the caller gets `Timeout`; a
    /// subsequently arriving response for this id is then unmatched.
    pub async fn wait(
        &self,
        unique_id: &str,
        receiver: oneshot::Receiver<OcppResult<Value>>,
        deadline: Duration,
    ) -> OcppResult<Value> {
        match timeout(deadline, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.entries.remove(unique_id);
                Err(OcppError::Connection("response channel closed".into()))
            }
            Err(_) => {
                if let Some((_, entry)) = self.entries.remove(unique_id) {
                    warn!(
                        unique_id,
                        action = entry.action.as_str(),
                        "Request timed out"
                    );
                }
                Err(OcppError::Timeout)
            }
        }
    }

    /// Force-resolve every still-pending entry with `reason`.
    ///
    /// Called when the connection closes so no caller hangs indefinitely.
    pub fn fail_all(&self, reason: &OcppError) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                warn!(
                    unique_id = id.as_str(),
                    action = entry.action.as_str(),
                    "Failing pending request: {}",
                    reason
                );
                let _ = entry.responder.send(Err(reason.clone()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
