//! Data model (spec.md §3): Device, Worker record, Reservation, and the
//! process-local reservable registry shape. These are plain data - the
//! behavior that mutates them lives in `worker::device`, `control::reservation`
//! and `store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `status ∈ {available, reserved, await_flash_default, flashing_default,
/// testing, broken}` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Available,
    Reserved,
    AwaitFlashDefault,
    FlashingDefault,
    Testing,
    Broken,
}

/// Unique by `serial`. Invariant: `status = reserved ⇔` exactly one active
/// reservation row references this device (enforced by `Store`, not this
/// struct).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,
    pub worker_name: String,
    pub status: DeviceStatus,
    /// Opaque host-local identifier of its current USB-over-IP export.
    pub bus_id: Option<String>,
}

/// Key `name`. Invariant: every device row references an existing worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: String,
    pub ip: String,
    pub server_port: u16,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Key `(device_serial, active)`. Invariant: at most one active reservation
/// per device; `expires_at > created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub device_serial: String,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub kind: Option<String>,
    pub args: Option<serde_json::Value>,
}

/// A single successful reservation result row, as returned by
/// `Store::make_reservations` and surfaced over `/reserve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservedDevice {
    pub serial: String,
    pub ip: String,
    pub server_port: u16,
}

/// Opaque device-event properties as delivered by the device adapter: `add`/
/// `remove` with `DEVNAME`, `DEVTYPE`, `SUBSYSTEM`, `DEVPATH`,
/// `ID_VENDOR_ID`, `ID_SERIAL_SHORT`, `ID_USB_INTERFACE_NUM` (spec.md §4.1).
pub type DeviceProperties = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventAction {
    Add,
    Remove,
}
