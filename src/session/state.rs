//! Per-connection session state
//!
//! Owned exclusively by the connection's processing task; handlers mutate it
//! through `&mut` without locking.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Identity and liveness state for one connected charge point.
#[derive(Debug)]
pub struct SessionState {
    /// Station ID; a placeholder until BootNotification reveals the real one.
    pub station_id: String,
    pub is_authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_count: u64,
    pub station_info: Option<StationInfo>,
    /// Latest reported status per (evse_id, connector_id).
    pub connectors: HashMap<(u32, u32), ConnectorStatus>,
    /// Latest meter reading per EVSE; general telemetry, not tied to a transaction.
    pub meter_readings: HashMap<u32, MeterReading>,
    pub security_events: Vec<SecurityEvent>,
    /// Set once the post-5th-heartbeat Authorize probe has fired.
    pub heartbeat_probe_sent: bool,
}

/// Station details reported in BootNotification.
#[derive(Debug, Clone)]
pub struct StationInfo {
    pub model: Option<String>,
    pub vendor_name: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub boot_reason: Option<String>,
    pub boot_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConnectorStatus {
    pub status: String,
    pub reported_at: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MeterReading {
    pub evse_id: u32,
    pub meter_value: Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub event_type: Option<String>,
    pub timestamp: Option<String>,
    pub tech_info: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(station_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            station_id: station_id.into(),
            is_authenticated: false,
            connected_at: now,
            last_heartbeat: now,
            heartbeat_count: 0,
            station_info: None,
            connectors: HashMap::new(),
            meter_readings: HashMap::new(),
            security_events: Vec::new(),
            heartbeat_probe_sent: false,
        }
    }

    /// Record a heartbeat; both counters move monotonically.
    pub fn record_heartbeat(&mut self) -> u64 {
        let now = Utc::now();
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
        self.heartbeat_count += 1;
        self.heartbeat_count
    }

    /// Record station info from a BootNotification payload.
    pub fn record_boot(&mut self, charging_station: &Value, reason: Option<&str>) {
        let get = |key: &str| {
            charging_station
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        self.station_info = Some(StationInfo {
            model: get("model"),
            vendor_name: get("vendorName"),
            serial_number: get("serialNumber"),
            firmware_version: get("firmwareVersion"),
            boot_reason: reason.map(str::to_string),
            boot_time: Utc::now(),
        });
        self.is_authenticated = true;
    }

    pub fn update_connector(
        &mut self,
        evse_id: u32,
        connector_id: u32,
        status: impl Into<String>,
        reported_at: Option<String>,
    ) {
        self.connectors.insert(
            (evse_id, connector_id),
            ConnectorStatus {
                status: status.into(),
                reported_at,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn record_meter_reading(&mut self, evse_id: u32, meter_value: Value) {
        self.meter_readings.insert(
            evse_id,
            MeterReading {
                evse_id,
                meter_value,
                received_at: Utc::now(),
            },
        );
    }
}
