//! Per-connection processing task
//!
//! One task owns the transport, the session state and the transaction
//! ledger for a single charge point. Inbound frames are processed strictly
//! in arrival order; other tasks reach the connection only through its
//! outbound channel and pending table, so none of the per-connection state
//! needs locking.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dispatch::DispatchTable;
use crate::session::{Outbound, PendingRequests, SessionState, TransactionLedger};
use crate::support::actions;
use crate::support::{
    ErrorPayload, MessageType, OcppError, OcppMessage, OcppResult, ShutdownSignal,
};
use crate::transport::Transport;

use super::ServerContext;

/// Drive one charge point connection until the peer disconnects, the
/// session is evicted, or the server shuts down.
pub async fn run_connection<T: Transport>(
    mut transport: T,
    station_id: String,
    ctx: Arc<ServerContext>,
    shutdown: ShutdownSignal,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let pending = Arc::new(PendingRequests::new());
    let token = ctx
        .registry
        .register(&station_id, outbound_tx, pending.clone());
    ctx.stats.connections_opened.increment();

    let mut session = SessionState::new(&station_id);
    let mut ledger = TransactionLedger::new();

    let shutdown_fut = shutdown.notified().wait();
    tokio::pin!(shutdown_fut);

    loop {
        tokio::select! {
            inbound = transport.recv() => {
                match inbound {
                    Some(Ok(text)) => {
                        handle_frame(&text, &mut transport, &mut session, &mut ledger, &ctx, &pending).await;
                    }
                    Some(Err(e)) => {
                        warn!(station_id = session.station_id.as_str(), "Transport fault: {}", e);
                        break;
                    }
                    None => {
                        info!(station_id = session.station_id.as_str(), "Charge point disconnected");
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
                        ctx.stats.messages_sent.increment();
                    }
                    Some(Outbound::Close) => {
                        info!(station_id = session.station_id.as_str(), "Closing connection on request");
                        transport.close().await;
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut shutdown_fut => {
                info!(station_id = session.station_id.as_str(), "Closing connection for shutdown");
                transport.close().await;
                break;
            }
        }
    }

    ctx.registry.unregister(&session.station_id, token);
    ctx.stats.connections_closed.increment();
}

/// Decode and route one inbound frame.
async fn handle_frame<T: Transport>(
    text: &str,
    transport: &mut T,
    session: &mut SessionState,
    ledger: &mut TransactionLedger,
    ctx: &Arc<ServerContext>,
    pending: &Arc<PendingRequests>,
) {
    ctx.stats.messages_received.increment();
    metrics::counter!("ocpp_messages_received_total").increment(1);

    let message = match OcppMessage::decode(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(station_id = session.station_id.as_str(), "Dropping malformed frame: {}", e);
            ctx.stats.malformed_frames.increment();
            return;
        }
    };

    match message.message_type {
        MessageType::Call => {
            // action presence was validated at decode time
            let action = message.action.as_deref().unwrap_or_default().to_string();
            debug!(
                station_id = session.station_id.as_str(),
                action = action.as_str(),
                unique_id = message.unique_id.as_str(),
                "Handling call"
            );
            let reply = handle_call(&action, message.payload, session, ledger, ctx).await;
            let frame = match reply {
                Ok(payload) => OcppMessage::call_result(&message.unique_id, payload),
                Err(e) => {
                    warn!(
                        station_id = session.station_id.as_str(),
                        action = action.as_str(),
                        "Call failed: {}",
                        e
                    );
                    ctx.stats.errors_sent.increment();
                    OcppMessage::call_error(&message.unique_id, e.to_wire())
                }
            };
            if let Err(e) = transport.send(frame.encode()).await {
                warn!(station_id = session.station_id.as_str(), "Reply send failed: {}", e);
            } else {
                ctx.stats.messages_sent.increment();
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

/// Execute a CP→CSMS call and produce the response payload.
async fn handle_call(
    action: &str,
    payload: Value,
    session: &mut SessionState,
    ledger: &mut TransactionLedger,
    ctx: &Arc<ServerContext>,
) -> OcppResult<Value> {
    if !session.is_authenticated && action != actions::BOOT_NOTIFICATION {
        return Err(OcppError::Authentication(format!(
            "BootNotification required before {}",
            action
        )));
    }

    match action {
        actions::BOOT_NOTIFICATION => handle_boot(payload, session, ctx).await,
        actions::HEARTBEAT => handle_heartbeat(session, ctx),
        actions::AUTHORIZE => Ok(json!({"idTokenInfo": {"status": "Accepted"}})),
        actions::STATUS_NOTIFICATION => {
            let evse_id = payload["evseId"].as_u64().unwrap_or(0) as u32;
            let connector_id = payload["connectorId"].as_u64().unwrap_or(0) as u32;
            let status = payload["connectorStatus"].as_str().unwrap_or("Unknown");
            let reported_at = payload["timestamp"].as_str().map(str::to_string);
            info!(
                station_id = session.station_id.as_str(),
                evse_id, connector_id, status, "Status notification"
            );
            session.update_connector(evse_id, connector_id, status, reported_at);
            Ok(json!({}))
        }
        actions::TRANSACTION_EVENT => handle_transaction_event(payload, session, ledger, ctx),
        actions::METER_VALUES => {
            let evse_id = payload["evseId"].as_u64().unwrap_or(0) as u32;
            let meter_value = payload.get("meterValue").cloned().unwrap_or(json!([]));
            session.record_meter_reading(evse_id, meter_value);
            Ok(json!({}))
        }
        actions::DATA_TRANSFER => {
            let vendor_id = payload["vendorId"].as_str().unwrap_or("");
            info!(station_id = session.station_id.as_str(), vendor_id, "Data transfer");
            let mut reply = json!({"status": "Accepted"});
            if let Some(data) = payload.get("data") {
                reply["data"] = data.clone();
            }
            Ok(reply)
        }
        other => ctx.stubs.dispatch(other, payload, session).await,
    }
}

async fn handle_boot(
    payload: Value,
    session: &mut SessionState,
    ctx: &Arc<ServerContext>,
) -> OcppResult<Value> {
    let charging_station = payload.get("chargingStation").cloned().unwrap_or(json!({}));
    let reason = payload["reason"].as_str();
    session.record_boot(&charging_station, reason);
    ctx.stats.boots.increment();

    // A connection accepted under a placeholder identity takes the serial
    // number as its real station ID.
    if let Some(serial) = charging_station["serialNumber"].as_str() {
        if session.station_id != serial && session.station_id.starts_with(PLACEHOLDER_PREFIX) {
            if ctx.registry.rekey(&session.station_id, serial) {
                session.station_id = serial.to_string();
            }
        }
    }

    info!(
        station_id = session.station_id.as_str(),
        model = charging_station["model"].as_str().unwrap_or(""),
        vendor = charging_station["vendorName"].as_str().unwrap_or(""),
        reason = reason.unwrap_or(""),
        "Boot notification accepted"
    );

    if ctx.policy.authorize_on_boot {
        spawn_authorize_probe(
            ctx.clone(),
            session.station_id.clone(),
            ctx.policy.boot_probe_delay(),
            "post-boot",
        );
    }

    Ok(json!({
        "currentTime": Utc::now().to_rfc3339(),
        "interval": ctx.heartbeat_interval,
        "status": "Accepted",
    }))
}

fn handle_heartbeat(session: &mut SessionState, ctx: &Arc<ServerContext>) -> OcppResult<Value> {
    let count = session.record_heartbeat();
    ctx.registry.touch_heartbeat(&session.station_id);
    ctx.stats.heartbeats.increment();
    debug!(station_id = session.station_id.as_str(), count, "Heartbeat");

    let threshold = ctx.policy.authorize_after_heartbeats;
    if threshold > 0 && count == threshold && !session.heartbeat_probe_sent {
        session.heartbeat_probe_sent = true;
        spawn_authorize_probe(
            ctx.clone(),
            session.station_id.clone(),
            Duration::ZERO,
            "heartbeat",
        );
    }

    Ok(json!({"currentTime": Utc::now().to_rfc3339()}))
}

fn handle_transaction_event(
    payload: Value,
    session: &mut SessionState,
    ledger: &mut TransactionLedger,
    ctx: &Arc<ServerContext>,
) -> OcppResult<Value> {
    let event_type = payload["eventType"].as_str().unwrap_or("");
    let transaction_id = payload["transactionInfo"]["transactionId"].as_str();
    let evse_id = payload["evse"]["id"].as_u64().map(|v| v as u32);
    let connector_id = payload["evse"]["connectorId"].as_u64().map(|v| v as u32);
    let timestamp = payload["timestamp"].as_str();

    match event_type {
        "Started" => {
            let id = ledger.start(
                &session.station_id,
                transaction_id,
                evse_id,
                connector_id,
                timestamp,
            );
            ctx.stats.transactions_started.increment();
            info!(
                station_id = session.station_id.as_str(),
                transaction_id = id.as_str(),
                "Transaction event: Started"
            );
        }
        "Updated" => {
            if let Some(id) = transaction_id {
                ledger.update(id);
            }
        }
        "Ended" => {
            if let Some(id) = transaction_id {
                if ledger.end(id, timestamp).is_some() {
                    ctx.stats.transactions_completed.increment();
                    metrics::counter!("ocpp_transactions_completed_total").increment(1);
                }
            }
        }
        other => {
            return Err(OcppError::Validation(format!(
                "unknown transaction event type: {}",
                other
            )));
        }
    }

    Ok(json!({}))
}

/// Station IDs assigned before BootNotification reveals the real identity.
pub const PLACEHOLDER_PREFIX: &str = "PENDING-";

/// Fire one Authorize request at the charge point from a detached task, so
/// the connection's processing loop stays free to route the response back.
fn spawn_authorize_probe(
    ctx: Arc<ServerContext>,
    station_id: String,
    delay: Duration,
    trigger: &'static str,
) {
    tokio::spawn(async move {
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let payload = json!({"idToken": {"idToken": "AA12345", "type": "ISO14443"}});
        match ctx
            .registry
            .send_request(&station_id, actions::AUTHORIZE, payload, ctx.message_timeout)
            .await
        {
            Ok(response) => {
                info!(
                    station_id = station_id.as_str(),
                    trigger,
                    status = response["idTokenInfo"]["status"].as_str().unwrap_or(""),
                    "Authorize probe answered"
                );
            }
            Err(e) => {
                error!(station_id = station_id.as_str(), trigger, "Authorize probe failed: {}", e);
            }
        }
    });
}

/// Default server-side stub table for CP→CSMS notifications outside the
/// core set.
pub fn default_server_table() -> DispatchTable {
    use crate::dispatch::{ActionHandler, StaticReply};
    use async_trait::async_trait;

    struct SecurityEventRecorder;

    #[async_trait]
    impl ActionHandler for SecurityEventRecorder {
        async fn execute(&self, payload: Value, session: &mut SessionState) -> OcppResult<Value> {
            let event = crate::session::state::SecurityEvent {
                event_type: payload["type"].as_str().map(str::to_string),
                timestamp: payload["timestamp"].as_str().map(str::to_string),
                tech_info: payload["techInfo"].as_str().map(str::to_string),
                received_at: Utc::now(),
            };
            warn!(
                station_id = session.station_id.as_str(),
                event_type = event.event_type.as_deref().unwrap_or(""),
                "Security event reported"
            );
            session.security_events.push(event);
            Ok(json!({}))
        }
    }

    let mut table = DispatchTable::new();
    for action in actions::SERVER_STUB_ACTIONS {
        table.register(*action, Arc::new(StaticReply(json!({}))));
    }
    table.register("SecurityEventNotification", Arc::new(SecurityEventRecorder));
    table
}
