//! Cross-cutting support: wire envelope, error taxonomy, shutdown.

pub mod actions;
pub mod envelope;
pub mod errors;
pub mod shutdown;

pub use envelope::{ErrorPayload, MessageError, MessageType, OcppMessage};
pub use errors::{OcppError, OcppResult};
pub use shutdown::{listen_for_shutdown_signals, ShutdownSignal};
