//! Session management: correlation table, per-connection state,
//! transaction ledger and the server-side registry.

pub mod pending;
pub mod registry;
pub mod state;
pub mod transactions;

pub use pending::PendingRequests;
pub use registry::{Outbound, SessionHandle, SessionRegistry, SharedSessionRegistry};
pub use state::SessionState;
pub use transactions::{Transaction, TransactionLedger, TransactionStatus};
