//! CSMS server
//!
//! Accepts charge point WebSocket connections, negotiates the `ocpp2.1`
//! subprotocol, and spawns one processing task per connection. Background
//! monitors watch heartbeat liveness and log traffic counters.

pub mod connection;
pub mod monitor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{info, warn};

use crate::config::{ProbePolicy, ServerConfig};
use crate::dispatch::DispatchTable;
use crate::session::{SessionRegistry, SharedSessionRegistry};
use crate::support::{OcppError, OcppResult, ShutdownSignal};
use crate::transport::WsTransport;

pub use connection::{default_server_table, run_connection, PLACEHOLDER_PREFIX};

/// The WebSocket subprotocol charge points are expected to offer.
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.1";

/// Monotonic counter shared between the connection tasks and the monitors.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Traffic counters for the whole server.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_opened: Counter,
    pub connections_closed: Counter,
    pub messages_received: Counter,
    pub messages_sent: Counter,
    pub malformed_frames: Counter,
    pub errors_sent: Counter,
    pub boots: Counter,
    pub heartbeats: Counter,
    pub transactions_started: Counter,
    pub transactions_completed: Counter,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shared dependencies handed to every connection task.
pub struct ServerContext {
    pub registry: SharedSessionRegistry,
    pub stubs: Arc<DispatchTable>,
    pub policy: ProbePolicy,
    /// Heartbeat interval advertised to charge points, seconds.
    pub heartbeat_interval: u64,
    pub message_timeout: Duration,
    pub stats: Arc<ServerStats>,
}

/// The CSMS server: accept loop plus background monitors.
pub struct CsmsServer {
    config: ServerConfig,
    ctx: Arc<ServerContext>,
    shutdown: ShutdownSignal,
}

impl CsmsServer {
    pub fn new(config: ServerConfig, policy: ProbePolicy, shutdown: ShutdownSignal) -> Self {
        let ctx = Arc::new(ServerContext {
            registry: SessionRegistry::shared(),
            stubs: Arc::new(default_server_table()),
            policy,
            heartbeat_interval: config.heartbeat_interval,
            message_timeout: config.message_timeout(),
            stats: Arc::new(ServerStats::new()),
        });
        Self {
            config,
            ctx,
            shutdown,
        }
    }

    pub fn registry(&self) -> SharedSessionRegistry {
        self.ctx.registry.clone()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.ctx.stats.clone()
    }

    /// Bind, start the monitors, and accept connections until shutdown.
    pub async fn run(&self) -> OcppResult<()> {
        let address = self.config.address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| OcppError::Connection(format!("failed to bind {}: {}", address, e)))?;
        info!(address = address.as_str(), "CSMS server listening");

        tokio::spawn(monitor::run_heartbeat_monitor(
            self.ctx.registry.clone(),
            Duration::from_secs(self.config.heartbeat_interval),
            Duration::from_secs(self.config.monitor_check_interval),
            self.shutdown.clone(),
        ));
        tokio::spawn(monitor::run_stats_monitor(
            self.ctx.registry.clone(),
            self.ctx.stats.clone(),
            Duration::from_secs(self.config.stats_interval),
            self.shutdown.clone(),
        ));

        let shutdown_fut = self.shutdown.notified().wait();
        tokio::pin!(shutdown_fut);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let ctx = self.ctx.clone();
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                handle_socket(stream, peer.to_string(), ctx, shutdown).await;
                            });
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }
                _ = &mut shutdown_fut => {
                    info!("Stopping accept loop");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Upgrade one TCP stream to WebSocket and run its connection task.
async fn handle_socket(
    stream: TcpStream,
    peer: String,
    ctx: Arc<ServerContext>,
    shutdown: ShutdownSignal,
) {
    let mut path_id: Option<String> = None;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        path_id = station_id_from_path(request.uri().path());

        let offered = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if offered.split(',').any(|p| p.trim() == OCPP_SUBPROTOCOL) {
            // unwrap is safe: the subprotocol constant is valid header text
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                OCPP_SUBPROTOCOL.parse().unwrap(),
            );
        } else {
            warn!(offered, "Charge point did not offer the {} subprotocol", OCPP_SUBPROTOCOL);
        }
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = peer.as_str(), "WebSocket handshake failed: {}", e);
            return;
        }
    };

    let station_id = path_id.unwrap_or_else(|| format!("{}{}", PLACEHOLDER_PREFIX, peer));
    info!(peer = peer.as_str(), station_id = station_id.as_str(), "Charge point connected");
    run_connection(WsTransport::new(ws), station_id, ctx, shutdown).await;
}

/// Extract the station ID from a request path like `/ocpp/CP001` or `/CP001`.
fn station_id_from_path(path: &str) -> Option<String> {
    let id = path.rsplit('/').next().unwrap_or("");
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}
