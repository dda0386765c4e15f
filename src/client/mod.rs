//! Charge point client
//!
//! Mirrors the server's connection architecture from the other side: one
//! task owns the transport and processes inbound frames in order, while the
//! public API sends through an outbound channel and awaits responses via
//! the shared pending table. The inbound loop is running before
//! BootNotification is sent, so the boot response cannot be missed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::dispatch::{AcceptAll, DispatchTable, StaticReply};
use crate::server::OCPP_SUBPROTOCOL;
use crate::session::{Outbound, PendingRequests, SessionState, TransactionLedger};
use crate::support::actions;
use crate::support::{
    ErrorPayload, MessageType, OcppError, OcppMessage, OcppResult, ShutdownSignal,
};
use crate::transport::{Transport, WsTransport};

/// Exponential reconnect backoff, capped at one minute.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX).min(60);
    Duration::from_secs(secs)
}

/// Shared sending side: installs pending entries and queues frames.
struct RequestChannel {
    pending: Arc<PendingRequests>,
    outbound: mpsc::UnboundedSender<Outbound>,
    timeout: Duration,
}

impl RequestChannel {
    async fn request(&self, action: &str, payload: Value) -> OcppResult<Value> {
        let message = OcppMessage::call(action, payload);
        let receiver = self.pending.register(&message.unique_id, action);
        if self
            .outbound
            .send(Outbound::Frame(message.encode()))
            .is_err()
        {
            self.pending.abandon(&message.unique_id);
            return Err(OcppError::Connection("connection task stopped".into()));
        }
        self.pending.wait(&message.unique_id, receiver, self.timeout).await
    }
}

/// A connected charge point.
pub struct CpClient {
    config: ClientConfig,
    station_id: String,
    channel: Arc<RequestChannel>,
    ledger: Mutex<TransactionLedger>,
    shutdown: ShutdownSignal,
    loop_handle: Option<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
}

impl CpClient {
    /// Dial the CSMS, boot, and start heartbeating.
    pub async fn connect(config: ClientConfig, shutdown: ShutdownSignal) -> OcppResult<Self> {
        let station_id = config.station_id_or_generated();
        let url = format!("{}/{}", config.csms_url.trim_end_matches('/'), station_id);
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| OcppError::Connection(format!("invalid CSMS url {}: {}", url, e)))?;
        // unwrap is safe: the subprotocol constant is valid header text
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            OCPP_SUBPROTOCOL.parse().unwrap(),
        );

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| OcppError::Connection(format!("failed to connect to {}: {}", url, e)))?;
        info!(url = url.as_str(), station_id = station_id.as_str(), "Connected to CSMS");

        let mut client = Self::attach(
            WsTransport::new(ws),
            config,
            station_id,
            default_client_table(),
            shutdown,
        );
        let interval = client.boot("PowerUp").await?;
        client.start_heartbeat(interval);
        Ok(client)
    }

    /// Attach to an already-established transport without booting.
    ///
    /// The inbound loop starts immediately; callers drive boot and
    /// heartbeats themselves. This is the seam embeddings and tests use.
    pub fn attach<T: Transport + 'static>(
        transport: T,
        config: ClientConfig,
        station_id: String,
        table: DispatchTable,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingRequests::new());
        let channel = Arc::new(RequestChannel {
            pending: pending.clone(),
            outbound: outbound_tx,
            timeout: config.message_timeout(),
        });

        let session = SessionState::new(&station_id);
        let loop_handle = tokio::spawn(run_client_loop(
            transport,
            outbound_rx,
            pending,
            Arc::new(table),
            session,
            shutdown.clone(),
        ));

        Self {
            config,
            station_id,
            channel,
            ledger: Mutex::new(TransactionLedger::new()),
            shutdown,
            loop_handle: Some(loop_handle),
            heartbeat_handle: None,
        }
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    /// Send BootNotification and return the heartbeat interval the CSMS
    /// assigned. Anything but an Accepted status fails authentication.
    pub async fn boot(&self, reason: &str) -> OcppResult<u64> {
        let payload = json!({
            "chargingStation": {
                "model": self.config.model,
                "vendorName": self.config.vendor_name,
                "serialNumber": self.config.serial_number,
                "firmwareVersion": self.config.firmware_version,
            },
            "reason": reason,
        });
        // An unanswered boot fails this connection attempt the same way a
        // rejection does.
        let response = match self.channel.request(actions::BOOT_NOTIFICATION, payload).await {
            Ok(response) => response,
            Err(OcppError::Timeout) => {
                return Err(OcppError::Authentication(
                    "no response to BootNotification".into(),
                ));
            }
            Err(e) => return Err(e),
        };

        let status = response["status"].as_str().unwrap_or("");
        if status != "Accepted" {
            return Err(OcppError::Authentication(format!(
                "boot rejected with status {}",
                status
            )));
        }
        let interval = response["interval"]
            .as_u64()
            .unwrap_or(self.config.heartbeat_interval);
        info!(
            station_id = self.station_id.as_str(),
            interval, "Boot accepted"
        );
        Ok(interval)
    }

    /// Start the periodic heartbeat task. The CSMS-assigned interval wins
    /// over the configured one when it is tighter.
    pub fn start_heartbeat(&mut self, csms_interval: u64) {
        let interval = self.config.heartbeat_interval.min(csms_interval).max(1);
        let channel = self.channel.clone();
        let station_id = self.station_id.clone();
        let shutdown = self.shutdown.clone();

        self.heartbeat_handle = Some(tokio::spawn(async move {
            let shutdown_fut = shutdown.notified().wait();
            tokio::pin!(shutdown_fut);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                    _ = &mut shutdown_fut => break,
                }
                match channel.request(actions::HEARTBEAT, json!({})).await {
                    Ok(response) => {
                        debug!(
                            station_id = station_id.as_str(),
                            current_time = response["currentTime"].as_str().unwrap_or(""),
                            "Heartbeat acknowledged"
                        );
                    }
                    Err(OcppError::Connection(e)) => {
                        warn!(station_id = station_id.as_str(), "Heartbeat stopped: {}", e);
                        break;
                    }
                    Err(e) => {
                        warn!(station_id = station_id.as_str(), "Heartbeat failed: {}", e);
                    }
                }
            }
        }));
    }

    /// Send an arbitrary Call and await its matched response.
    pub async fn send_request(&self, action: &str, payload: Value) -> OcppResult<Value> {
        self.channel.request(action, payload).await
    }

    /// Send one heartbeat and return the CSMS clock.
    pub async fn send_heartbeat(&self) -> OcppResult<Value> {
        self.channel.request(actions::HEARTBEAT, json!({})).await
    }

    /// Ask the CSMS to authorize an id token; generates an RFID-style token
    /// when none is given.
    pub async fn authorize(&self, id_token: Option<String>) -> OcppResult<Value> {
        let token = id_token.unwrap_or_else(|| {
            format!("RFID-{}", &Uuid::new_v4().simple().to_string()[..8].to_uppercase())
        });
        self.channel
            .request(
                actions::AUTHORIZE,
                json!({"idToken": {"idToken": token, "type": "ISO14443"}}),
            )
            .await
    }

    pub async fn send_status_notification(
        &self,
        evse_id: u32,
        connector_id: u32,
        status: &str,
    ) -> OcppResult<Value> {
        self.channel
            .request(
                actions::STATUS_NOTIFICATION,
                json!({
                    "timestamp": Utc::now().to_rfc3339(),
                    "connectorStatus": status,
                    "evseId": evse_id,
                    "connectorId": connector_id,
                }),
            )
            .await
    }

    /// Begin a transaction and return its synthesized ID.
    pub async fn start_transaction(
        &self,
        evse_id: u32,
        connector_id: u32,
    ) -> OcppResult<String> {
        let timestamp = Utc::now().to_rfc3339();
        let transaction_id = {
            let mut ledger = self.ledger.lock().await;
            ledger.start(
                &self.station_id,
                None,
                Some(evse_id),
                Some(connector_id),
                Some(&timestamp),
            )
        };
        self.channel
            .request(
                actions::TRANSACTION_EVENT,
                json!({
                    "eventType": "Started",
                    "timestamp": timestamp,
                    "transactionInfo": {"transactionId": transaction_id},
                    "evse": {"id": evse_id, "connectorId": connector_id},
                }),
            )
            .await?;
        Ok(transaction_id)
    }

    /// Report progress on an active transaction.
    pub async fn update_transaction(
        &self,
        transaction_id: &str,
        meter_value: Option<Value>,
    ) -> OcppResult<Value> {
        {
            let mut ledger = self.ledger.lock().await;
            ledger.update(transaction_id);
        }
        let mut payload = json!({
            "eventType": "Updated",
            "timestamp": Utc::now().to_rfc3339(),
            "transactionInfo": {"transactionId": transaction_id},
        });
        if let Some(meter_value) = meter_value {
            payload["meterValue"] = meter_value;
        }
        self.channel.request(actions::TRANSACTION_EVENT, payload).await
    }

    /// End a transaction.
    pub async fn end_transaction(&self, transaction_id: &str) -> OcppResult<Value> {
        let timestamp = Utc::now().to_rfc3339();
        {
            let mut ledger = self.ledger.lock().await;
            ledger.end(transaction_id, Some(&timestamp));
        }
        self.channel
            .request(
                actions::TRANSACTION_EVENT,
                json!({
                    "eventType": "Ended",
                    "timestamp": timestamp,
                    "transactionInfo": {"transactionId": transaction_id},
                }),
            )
            .await
    }

    pub async fn send_meter_values(&self, evse_id: u32, meter_value: Value) -> OcppResult<Value> {
        self.channel
            .request(
                actions::METER_VALUES,
                json!({"evseId": evse_id, "meterValue": meter_value}),
            )
            .await
    }

    pub async fn send_data_transfer(
        &self,
        vendor_id: &str,
        data: Option<Value>,
    ) -> OcppResult<Value> {
        let mut payload = json!({"vendorId": vendor_id});
        if let Some(data) = data {
            payload["data"] = data;
        }
        self.channel.request(actions::DATA_TRANSFER, payload).await
    }

    /// Close the connection and stop the background tasks.
    pub async fn disconnect(&mut self) {
        if let Some(handle) = self.heartbeat_handle.take() {
            handle.abort();
        }
        let _ = self.channel.outbound.send(Outbound::Close);
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }
        info!(station_id = self.station_id.as_str(), "Disconnected");
    }

    /// Wait for the connection task to end (peer closed or fault).
    pub async fn closed(&mut self) {
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }
    }
}

/// Run a charge point with reconnect, until shutdown or the attempt budget
/// is spent. The attempt counter resets after every successful session.
pub async fn run_charge_point(config: ClientConfig, shutdown: ShutdownSignal) -> OcppResult<()> {
    let mut attempt: u32 = 0;
    while !shutdown.is_triggered() {
        match CpClient::connect(config.clone(), shutdown.clone()).await {
            Ok(mut client) => {
                attempt = 0;
                client.closed().await;
                if shutdown.is_triggered() {
                    break;
                }
                warn!(
                    station_id = client.station_id(),
                    "Connection lost, reconnecting"
                );
            }
            Err(e) => {
                attempt += 1;
                if attempt >= config.max_reconnect_attempts {
                    return Err(OcppError::Connection(format!(
                        "giving up after {} attempts: {}",
                        attempt, e
                    )));
                }
                let delay = backoff_delay(attempt);
                warn!(
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Connect failed: {}, retrying",
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    Ok(())
}

/// Inbound loop: routes responses to the pending table and answers
/// CSMS-initiated calls through the dispatch table.
async fn run_client_loop<T: Transport>(
    mut transport: T,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    pending: Arc<PendingRequests>,
    table: Arc<DispatchTable>,
    mut session: SessionState,
    shutdown: ShutdownSignal,
) {
    let shutdown_fut = shutdown.notified().wait();
    tokio::pin!(shutdown_fut);

    loop {
        tokio::select! {
            inbound = transport.recv() => {
                match inbound {
                    Some(Ok(text)) => {
                        handle_frame(&text, &mut transport, &mut session, &table, &pending).await;
                    }
                    Some(Err(e)) => {
                        warn!(station_id = session.station_id.as_str(), "Transport fault: {}", e);
                        break;
                    }
                    None => {
                        info!(station_id = session.station_id.as_str(), "CSMS closed the connection");
                        break;
                    }
                }
            }
            command = outbound_rx.recv() => {
                match command {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = transport.send(frame).await {
                            warn!(station_id = session.station_id.as_str(), "Send failed: {}", e);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        transport.close().await;
                        break;
                    }
                }
            }
            _ = &mut shutdown_fut => {
                transport.close().await;
                break;
            }
        }
    }

    pending.fail_all(&OcppError::Connection("connection closed".into()));
}

async fn handle_frame<T: Transport>(
    text: &str,
    transport: &mut T,
    session: &mut SessionState,
    table: &DispatchTable,
    pending: &Arc<PendingRequests>,
) {
    let message = match OcppMessage::decode(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(station_id = session.station_id.as_str(), "Dropping malformed frame: {}", e);
            return;
        }
    };

    match message.message_type {
        MessageType::Call => {
            let action = message.action.as_deref().unwrap_or_default().to_string();
            debug!(
                station_id = session.station_id.as_str(),
                action = action.as_str(),
                "Handling CSMS call"
            );
            let frame = match table.dispatch(&action, message.payload, session).await {
                Ok(payload) => OcppMessage::call_result(&message.unique_id, payload),
                Err(e) => {
                    warn!(
                        station_id = session.station_id.as_str(),
                        action = action.as_str(),
                        "CSMS call failed: {}",
                        e
                    );
                    OcppMessage::call_error(&message.unique_id, e.to_wire())
                }
            };
            if let Err(e) = transport.send(frame.encode()).await {
                warn!(station_id = session.station_id.as_str(), "Reply send failed: {}", e);
            }
        }
        MessageType::CallResult => {
            pending.resolve(&message.unique_id, Ok(message.payload));
        }
        MessageType::CallError => {
            let error = OcppError::from_wire(&ErrorPayload::from_value(&message.payload));
            pending.resolve(&message.unique_id, Err(error));
        }
    }
}

/// Default handlers for CSMS-initiated calls.
pub fn default_client_table() -> DispatchTable {
    let mut table = DispatchTable::new();

    table.register(
        actions::AUTHORIZE,
        Arc::new(StaticReply(json!({"idTokenInfo": {"status": "Accepted"}}))),
    );
    table.register(
        "GetLocalListVersion",
        Arc::new(StaticReply(json!({"versionNumber": 0}))),
    );
    table.register(
        "UnlockConnector",
        Arc::new(StaticReply(json!({"status": "Unlocked"}))),
    );
    table.register(
        "GetInstalledCertificateIds",
        Arc::new(StaticReply(json!({"status": "NotFound"}))),
    );
    table.register(
        "GetTransactionStatus",
        Arc::new(StaticReply(json!({"messagesInQueue": false}))),
    );
    table.register(
        "GetVariables",
        Arc::new(StaticReply(json!({"getVariableResult": []}))),
    );
    table.register(
        "SetVariables",
        Arc::new(StaticReply(json!({"setVariableResult": []}))),
    );
    table.register(
        "SetVariableMonitoring",
        Arc::new(StaticReply(json!({"setMonitoringResult": []}))),
    );
    table.register(
        "ClearVariableMonitoring",
        Arc::new(StaticReply(json!({"clearMonitoringResult": []}))),
    );
    for action in [
        "GetBaseReport",
        "GetReport",
        "GetMonitoringReport",
        "GetChargingProfiles",
        "GetDisplayMessages",
        "SetNetworkProfile",
    ] {
        table.register(action, Arc::new(StaticReply(json!({"status": "Accepted"}))));
    }
    for action in actions::CLIENT_ACCEPT_ACTIONS {
        table.register(*action, Arc::new(AcceptAll));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;

    fn attach_client(transport: InMemoryTransport) -> CpClient {
        let config = ClientConfig {
            station_id: Some("CP042".to_string()),
            serial_number: "CP042".to_string(),
            message_timeout: 1,
            ..ClientConfig::default()
        };
        CpClient::attach(
            transport,
            config.clone(),
            config.station_id_or_generated(),
            default_client_table(),
            ShutdownSignal::new(),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn boot_parses_accepted_response() {
        let (client_end, mut server_end) = InMemoryTransport::pair();
        let client = attach_client(client_end);

        let responder = tokio::spawn(async move {
            let frame = server_end.recv().await.unwrap().unwrap();
            let call = OcppMessage::decode(&frame).unwrap();
            assert_eq!(call.action.as_deref(), Some(actions::BOOT_NOTIFICATION));
            assert_eq!(call.payload["chargingStation"]["serialNumber"], "CP042");
            let reply = OcppMessage::call_result(
                &call.unique_id,
                json!({"currentTime": "2026-01-01T00:00:00Z", "interval": 120, "status": "Accepted"}),
            );
            server_end.send(reply.encode()).await.unwrap();
            server_end
        });

        let interval = client.boot("PowerUp").await.unwrap();
        assert_eq!(interval, 120);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_boot_is_an_authentication_error() {
        let (client_end, mut server_end) = InMemoryTransport::pair();
        let client = attach_client(client_end);

        tokio::spawn(async move {
            let frame = server_end.recv().await.unwrap().unwrap();
            let call = OcppMessage::decode(&frame).unwrap();
            let reply = OcppMessage::call_result(
                &call.unique_id,
                json!({"currentTime": "2026-01-01T00:00:00Z", "interval": 300, "status": "Rejected"}),
            );
            server_end.send(reply.encode()).await.unwrap();
            // Keep the peer alive until the assertion runs
            let _ = server_end.recv().await;
        });

        let err = client.boot("PowerUp").await.unwrap_err();
        assert_eq!(err.error_code(), "AuthenticationError");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_boot_is_an_authentication_error() {
        let (client_end, server_end) = InMemoryTransport::pair();
        let client = attach_client(client_end);

        // Never answer; keep the peer alive so the timeout fires first.
        let err = client.boot("PowerUp").await.unwrap_err();
        assert_eq!(err.error_code(), "AuthenticationError");
        drop(server_end);
    }

    #[tokio::test]
    async fn csms_authorize_probe_gets_an_accepted_reply() {
        let (client_end, mut server_end) = InMemoryTransport::pair();
        let _client = attach_client(client_end);

        let probe = OcppMessage::call(actions::AUTHORIZE, json!({"idToken": {"idToken": "AA12345"}}));
        server_end.send(probe.encode()).await.unwrap();

        let frame = server_end.recv().await.unwrap().unwrap();
        let reply = OcppMessage::decode(&frame).unwrap();
        assert_eq!(reply.message_type, MessageType::CallResult);
        assert_eq!(reply.unique_id, probe.unique_id);
        assert_eq!(reply.payload["idTokenInfo"]["status"], "Accepted");
    }

    #[tokio::test]
    async fn unknown_csms_call_yields_call_error() {
        let (client_end, mut server_end) = InMemoryTransport::pair();
        let _client = attach_client(client_end);

        let call = OcppMessage::call("Frobnicate", json!({}));
        server_end.send(call.encode()).await.unwrap();

        let frame = server_end.recv().await.unwrap().unwrap();
        let reply = OcppMessage::decode(&frame).unwrap();
        assert_eq!(reply.message_type, MessageType::CallError);
        assert_eq!(reply.payload["error_code"], "NotSupportedError");
    }

    #[tokio::test]
    async fn transaction_ids_are_synthesized_in_sequence() {
        let (client_end, mut server_end) = InMemoryTransport::pair();
        let client = attach_client(client_end);

        let responder = tokio::spawn(async move {
            for _ in 0..2 {
                let frame = server_end.recv().await.unwrap().unwrap();
                let call = OcppMessage::decode(&frame).unwrap();
                let reply = OcppMessage::call_result(&call.unique_id, json!({}));
                server_end.send(reply.encode()).await.unwrap();
            }
            server_end
        });

        let first = client.start_transaction(1, 1).await.unwrap();
        let second = client.start_transaction(2, 1).await.unwrap();
        assert_eq!(first, "TXN_CP042_000001");
        assert_eq!(second, "TXN_CP042_000002");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_fails_requests_in_flight() {
        let (client_end, mut server_end) = InMemoryTransport::pair();
        let client = Arc::new(attach_client(client_end));

        let requester = {
            let client = client.clone();
            tokio::spawn(async move { client.send_heartbeat().await })
        };

        // Swallow the heartbeat, then drop the peer without answering.
        let _ = server_end.recv().await.unwrap().unwrap();
        server_end.close().await;
        drop(server_end);

        let err = requester.await.unwrap().unwrap_err();
        assert!(matches!(err, OcppError::Connection(_)));
    }
}
