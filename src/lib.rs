//! OCPP 2.1 message correlation and session management.
//!
//! Both sides of an OCPP link share the same core: a JSON envelope codec,
//! a pending-request table correlating responses to requests by unique ID,
//! and a per-connection task that owns the transport and processes inbound
//! frames strictly in order. On top of that core, [`server`] implements a
//! CSMS (central system) with a session registry, heartbeat-based eviction
//! and transaction tracking, and [`client`] implements a charge point with
//! automatic reconnect.
//!
//! The transport is pluggable through [`transport::Transport`]; production
//! uses WebSockets with the `ocpp2.1` subprotocol, tests use the in-memory
//! pair.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod server;
pub mod session;
pub mod support;
pub mod transport;

#[cfg(test)]
mod e2e;

pub use client::CpClient;
pub use config::AppConfig;
pub use server::CsmsServer;
pub use support::{OcppError, OcppMessage, OcppResult};
