//! Full-stack scenarios: a real client wired to a real server connection
//! task over the in-memory transport pair.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::client::{default_client_table, CpClient};
use crate::config::{ClientConfig, ProbePolicy};
use crate::server::monitor::check_heartbeats;
use crate::server::{default_server_table, run_connection, ServerContext, ServerStats};
use crate::session::SessionRegistry;
use crate::support::{OcppError, ShutdownSignal};
use crate::transport::InMemoryTransport;

fn server_context(policy: ProbePolicy) -> Arc<ServerContext> {
    Arc::new(ServerContext {
        registry: SessionRegistry::shared(),
        stubs: Arc::new(default_server_table()),
        policy,
        heartbeat_interval: 300,
        message_timeout: Duration::from_secs(1),
        stats: Arc::new(ServerStats::new()),
    })
}

fn quiet_policy() -> ProbePolicy {
    ProbePolicy {
        authorize_on_boot: false,
        boot_probe_delay_ms: 0,
        authorize_after_heartbeats: 0,
    }
}

/// Wire a client to a freshly spawned server connection task.
fn connect_pair(ctx: &Arc<ServerContext>, serial: &str) -> CpClient {
    let (client_end, server_end) = InMemoryTransport::pair();
    let shutdown = ShutdownSignal::new();
    tokio::spawn(run_connection(
        server_end,
        format!("PENDING-{}", serial),
        ctx.clone(),
        shutdown.clone(),
    ));

    let config = ClientConfig {
        station_id: Some(serial.to_string()),
        serial_number: serial.to_string(),
        message_timeout: 1,
        ..ClientConfig::default()
    };
    CpClient::attach(
        client_end,
        config,
        serial.to_string(),
        default_client_table(),
        shutdown,
    )
}

#[tokio::test]
async fn boot_authenticates_and_rekeys_the_session() {
    let ctx = server_context(quiet_policy());
    let client = connect_pair(&ctx, "CP042");

    let interval = client.boot("PowerUp").await.unwrap();
    assert_eq!(interval, 300);
    assert!(ctx.registry.is_connected("CP042"));
    assert!(!ctx.registry.is_connected("PENDING-CP042"));
    assert_eq!(ctx.stats.boots.get(), 1);
}

#[tokio::test]
async fn calls_before_boot_are_refused() {
    let ctx = server_context(quiet_policy());
    let client = connect_pair(&ctx, "CP042");

    let err = client.send_heartbeat().await.unwrap_err();
    assert_eq!(err.error_code(), "AuthenticationError");

    // The connection is still usable: boot goes through afterwards.
    client.boot("PowerUp").await.unwrap();
}

#[tokio::test]
async fn server_authorize_request_is_answered_by_the_client() {
    let ctx = server_context(quiet_policy());
    let client = connect_pair(&ctx, "CP042");
    client.boot("PowerUp").await.unwrap();

    let response = ctx
        .registry
        .send_request(
            "CP042",
            "Authorize",
            json!({"idToken": {"idToken": "AA12345", "type": "ISO14443"}}),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(response["idTokenInfo"]["status"], "Accepted");
}

#[tokio::test]
async fn heartbeats_are_counted_and_answered() {
    let ctx = server_context(quiet_policy());
    let client = connect_pair(&ctx, "CP042");
    client.boot("PowerUp").await.unwrap();

    for _ in 0..5 {
        let reply = client.send_heartbeat().await.unwrap();
        assert!(reply["currentTime"].is_string());
    }
    assert_eq!(ctx.stats.heartbeats.get(), 5);
}

#[tokio::test]
async fn transaction_lifecycle_round_trips() {
    let ctx = server_context(quiet_policy());
    let client = connect_pair(&ctx, "CP042");
    client.boot("PowerUp").await.unwrap();

    client
        .send_status_notification(1, 1, "Occupied")
        .await
        .unwrap();
    let transaction_id = client.start_transaction(1, 1).await.unwrap();
    assert_eq!(transaction_id, "TXN_CP042_000001");
    assert_eq!(ctx.stats.transactions_started.get(), 1);

    client
        .update_transaction(&transaction_id, Some(json!([{"value": 7.2}])))
        .await
        .unwrap();
    client.end_transaction(&transaction_id).await.unwrap();
    assert_eq!(ctx.stats.transactions_completed.get(), 1);
}

#[tokio::test]
async fn unknown_action_gets_call_error_and_connection_survives() {
    let ctx = server_context(quiet_policy());
    let client = connect_pair(&ctx, "CP042");
    client.boot("PowerUp").await.unwrap();

    let err = client.send_request("Frobnicate", json!({})).await.unwrap_err();
    assert_eq!(err.error_code(), "NotSupportedError");

    // The failed call must not poison the session.
    client.send_heartbeat().await.unwrap();
    assert!(ctx.registry.is_connected("CP042"));
}

#[tokio::test]
async fn data_transfer_echoes_data() {
    let ctx = server_context(quiet_policy());
    let client = connect_pair(&ctx, "CP042");
    client.boot("PowerUp").await.unwrap();

    let reply = client
        .send_data_transfer("com.voltlink", Some(json!({"key": "value"})))
        .await
        .unwrap();
    assert_eq!(reply["status"], "Accepted");
    assert_eq!(reply["data"]["key"], "value");
}

#[tokio::test]
async fn reconnecting_station_survives_the_old_tasks_cleanup() {
    let ctx = server_context(quiet_policy());
    let client1 = connect_pair(&ctx, "CP042");
    client1.boot("PowerUp").await.unwrap();

    // Reconnect before the server notices the first connection is gone. The
    // boot rekey replaces the first handle, waking its task for cleanup.
    let client2 = connect_pair(&ctx, "CP042");
    client2.boot("PowerUp").await.unwrap();

    // Let the replaced task run its cleanup, then verify it left the live
    // session registered and serviceable.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ctx.registry.is_connected("CP042"));
    client2.send_heartbeat().await.unwrap();
}

#[tokio::test]
async fn eviction_closes_the_connection_and_fails_pending_requests() {
    let ctx = server_context(quiet_policy());
    let mut client = connect_pair(&ctx, "CP042");
    client.boot("PowerUp").await.unwrap();

    // Make the session look silent for far longer than 4x the interval.
    ctx.registry
        .backdate_heartbeat("CP042", chrono::Duration::seconds(3000));
    let (_, evicted) = check_heartbeats(&ctx.registry, Duration::from_secs(300));
    assert_eq!(evicted, vec!["CP042".to_string()]);
    assert!(!ctx.registry.is_connected("CP042"));

    // The server side closes its transport; the client observes the close.
    client.closed().await;
    let err = client.send_heartbeat().await.unwrap_err();
    assert!(matches!(err, OcppError::Connection(_)));
}

#[tokio::test]
async fn post_boot_probe_reaches_the_client() {
    let policy = ProbePolicy {
        authorize_on_boot: true,
        boot_probe_delay_ms: 0,
        authorize_after_heartbeats: 0,
    };
    let ctx = server_context(policy);
    let client = connect_pair(&ctx, "CP042");
    client.boot("PowerUp").await.unwrap();

    // The probe runs on a detached task; the client's dispatch table answers
    // it without any test involvement. Poll until the round trip shows up in
    // the traffic counters.
    for _ in 0..50 {
        if ctx.stats.messages_received.get() >= 2 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Authorize probe response never arrived");
}
