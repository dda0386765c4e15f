//! Transaction ledger
//!
//! Tracks one session's charging transactions: an active map keyed by
//! transaction ID plus a completed history. Owned by the connection task,
//! same as [`super::state::SessionState`].

use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Completed,
}

/// One charging session on a connector, from Started to Ended.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub transaction_id: String,
    pub evse_id: Option<u32>,
    pub connector_id: Option<u32>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub status: TransactionStatus,
}

/// Per-session transaction map plus completed history.
#[derive(Debug, Default)]
pub struct TransactionLedger {
    active: HashMap<String, Transaction>,
    history: Vec<Transaction>,
    sequence: u64,
}

impl TransactionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synthesize a station-unique transaction ID.
    pub fn next_transaction_id(&mut self, station_id: &str) -> String {
        self.sequence += 1;
        format!("TXN_{}_{:06}", station_id, self.sequence)
    }

    /// Handle TransactionEvent(Started). Synthesizes an ID when the CP did
    /// not supply one; restarting an already-active ID is idempotent.
    pub fn start(
        &mut self,
        station_id: &str,
        transaction_id: Option<&str>,
        evse_id: Option<u32>,
        connector_id: Option<u32>,
        timestamp: Option<&str>,
    ) -> String {
        let id = match transaction_id {
            Some(id) => id.to_string(),
            None => self.next_transaction_id(station_id),
        };

        if self.active.contains_key(&id) {
            warn!(transaction_id = id.as_str(), "Transaction already active, ignoring duplicate Started");
            return id;
        }

        self.active.insert(
            id.clone(),
            Transaction {
                transaction_id: id.clone(),
                evse_id,
                connector_id,
                start_time: timestamp.map(str::to_string),
                end_time: None,
                status: TransactionStatus::Active,
            },
        );
        info!(transaction_id = id.as_str(), evse_id, "Transaction started");
        id
    }

    /// Handle an intermediate TransactionEvent (Updated). Unknown references
    /// are accepted idempotently; CPs may restart and resend stale IDs.
    pub fn update(&mut self, transaction_id: &str) {
        if !self.active.contains_key(transaction_id) {
            info!(transaction_id, "Update for unknown transaction, accepting idempotently");
        }
    }

    /// Handle TransactionEvent(Ended): move active → history and stamp the
    /// end time. Returns the completed transaction, or `None` for an
    /// unknown reference (accepted idempotently).
    pub fn end(&mut self, transaction_id: &str, timestamp: Option<&str>) -> Option<Transaction> {
        match self.active.remove(transaction_id) {
            Some(mut transaction) => {
                transaction.end_time = timestamp.map(str::to_string);
                transaction.status = TransactionStatus::Completed;
                self.history.push(transaction.clone());
                info!(transaction_id, "Transaction completed");
                Some(transaction)
            }
            None => {
                info!(transaction_id, "Ended for unknown transaction, accepting idempotently");
                None
            }
        }
    }

    pub fn active(&self) -> &HashMap<String, Transaction> {
        &self.active
    }

    pub fn history(&self) -> &[Transaction] {
        &self.history
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_without_id_synthesizes_unique_ids() {
        let mut ledger = TransactionLedger::new();
        let a = ledger.start("CP001", None, Some(1), Some(1), None);
        let b = ledger.start("CP001", None, Some(2), Some(1), None);
        assert_ne!(a, b);
        assert!(a.starts_with("TXN_CP001_"));
        assert_eq!(ledger.active_count(), 2);
    }

    #[test]
    fn ended_moves_to_history_exactly_once() {
        let mut ledger = TransactionLedger::new();
        let id = ledger.start("CP001", None, Some(1), Some(1), Some("t0"));
        let completed = ledger.end(&id, Some("t1")).unwrap();
        assert_eq!(completed.status, TransactionStatus::Completed);
        assert_eq!(completed.end_time.as_deref(), Some("t1"));
        assert_eq!(ledger.active_count(), 0);
        assert_eq!(ledger.history().len(), 1);

        // Second Ended for the same ID is idempotent
        assert!(ledger.end(&id, Some("t2")).is_none());
        assert_eq!(ledger.history().len(), 1);
    }

    #[test]
    fn duplicate_started_does_not_clobber_active_entry() {
        let mut ledger = TransactionLedger::new();
        let id = ledger.start("CP001", Some("TXN-1"), Some(1), Some(1), Some("t0"));
        ledger.start("CP001", Some("TXN-1"), Some(9), Some(9), Some("t9"));
        assert_eq!(ledger.active_count(), 1);
        assert_eq!(ledger.active()[&id].evse_id, Some(1));
    }

    #[test]
    fn update_of_unknown_reference_is_accepted() {
        let mut ledger = TransactionLedger::new();
        ledger.update("TXN_STALE_000001");
        assert_eq!(ledger.active_count(), 0);
    }
}
