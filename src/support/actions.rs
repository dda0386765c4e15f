//! OCPP 2.1 action names used by the core routing paths.
//!
//! Actions outside this list still flow through the generic send/await and
//! dispatch machinery; these constants only exist so the core handlers and
//! the default stub tables agree on spelling.

pub const AUTHORIZE: &str = "Authorize";
pub const BOOT_NOTIFICATION: &str = "BootNotification";
pub const HEARTBEAT: &str = "Heartbeat";
pub const STATUS_NOTIFICATION: &str = "StatusNotification";
pub const TRANSACTION_EVENT: &str = "TransactionEvent";
pub const METER_VALUES: &str = "MeterValues";
pub const DATA_TRANSFER: &str = "DataTransfer";

/// CP→CSMS notifications answered by the server's stub table.
pub const SERVER_STUB_ACTIONS: &[&str] = &[
    "LogStatusNotification",
    "FirmwareStatusNotification",
    "ReservationStatusUpdate",
    "ReportChargingProfiles",
    "NotifyReport",
    "NotifyMonitoringReport",
    "NotifyDisplayMessages",
    "CostUpdated",
];

/// CSMS→CP commands the client answers with a plain Accepted.
pub const CLIENT_ACCEPT_ACTIONS: &[&str] = &[
    "RequestStartTransaction",
    "RequestStopTransaction",
    "SetChargingProfile",
    "ClearChargingProfile",
    "ChangeAvailability",
    "Reset",
    "ClearCache",
    "UpdateFirmware",
    "SendLocalList",
    "ReserveNow",
    "CancelReservation",
    "SignCertificate",
    "CertificateSigned",
    "DeleteCertificate",
    "InstallCertificate",
    "GetCertificateStatus",
    "GetCertificateChainStatus",
    "SetDefaultTariff",
    "SetDisplayMessage",
    "ClearDisplayMessage",
    "SetMonitoringBase",
    "SetMonitoringLevel",
    "TriggerMessage",
    "DataTransfer",
    "GetLog",
    "Get15118EVCertificate",
];
