//! Background monitors
//!
//! The heartbeat monitor scans the registry on a fixed cadence, warning on
//! sessions past twice the expected heartbeat interval and evicting those
//! past four times. The stats monitor periodically logs traffic counters
//! and publishes them as metrics.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::session::{SessionRegistry, SharedSessionRegistry};
use crate::support::ShutdownSignal;

use super::ServerStats;

/// One pass over the registry. Returns (warned, evicted) station IDs.
pub fn check_heartbeats(
    registry: &SessionRegistry,
    expected_interval: Duration,
) -> (Vec<String>, Vec<String>) {
    let warn_after = 2 * expected_interval.as_secs() as i64;
    let evict_after = 4 * expected_interval.as_secs() as i64;
    let now = Utc::now();

    let mut warned = Vec::new();
    let mut evicted = Vec::new();

    for (station_id, last_heartbeat) in registry.heartbeat_snapshot() {
        let silent_for = now.signed_duration_since(last_heartbeat).num_seconds();
        if silent_for > evict_after {
            warn!(
                station_id = station_id.as_str(),
                silent_for, "No heartbeat, evicting session"
            );
            registry.evict(&station_id);
            evicted.push(station_id);
        } else if silent_for > warn_after {
            warn!(
                station_id = station_id.as_str(),
                silent_for, "Heartbeat overdue"
            );
            warned.push(station_id);
        }
    }

    (warned, evicted)
}

/// Scan the registry every `check_interval` until shutdown.
pub async fn run_heartbeat_monitor(
    registry: SharedSessionRegistry,
    expected_interval: Duration,
    check_interval: Duration,
    shutdown: ShutdownSignal,
) {
    info!(
        expected_secs = expected_interval.as_secs(),
        check_secs = check_interval.as_secs(),
        "Heartbeat monitor started"
    );
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let shutdown_fut = shutdown.notified().wait();
    tokio::pin!(shutdown_fut);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (_, evicted) = check_heartbeats(&registry, expected_interval);
                for station_id in &evicted {
                    counter!("ocpp_sessions_evicted_total").increment(1);
                    debug!(station_id = station_id.as_str(), "Eviction recorded");
                }
            }
            _ = &mut shutdown_fut => {
                info!("Heartbeat monitor stopped");
                break;
            }
        }
    }
}

/// Log and publish traffic counters every `interval` until shutdown.
pub async fn run_stats_monitor(
    registry: SharedSessionRegistry,
    stats: Arc<ServerStats>,
    interval: Duration,
    shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let shutdown_fut = shutdown.notified().wait();
    tokio::pin!(shutdown_fut);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let active = registry.count();
                gauge!("ocpp_sessions_active").set(active as f64);
                gauge!("ocpp_messages_received_total").set(stats.messages_received.get() as f64);
                gauge!("ocpp_messages_sent_total").set(stats.messages_sent.get() as f64);
                info!(
                    active_sessions = active,
                    messages_received = stats.messages_received.get(),
                    messages_sent = stats.messages_sent.get(),
                    boots = stats.boots.get(),
                    heartbeats = stats.heartbeats.get(),
                    transactions_started = stats.transactions_started.get(),
                    transactions_completed = stats.transactions_completed.get(),
                    errors_sent = stats.errors_sent.get(),
                    "Server statistics"
                );
            }
            _ = &mut shutdown_fut => break,
        }
    }
}
