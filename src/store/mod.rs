//! The `Store` trait: the contract the stored procedures of spec.md §6
//! expose. The relational store itself is explicitly out of scope
//! (spec.md §1): "the relational store of workers/devices/reservations
//! (treated as a set of named stored procedures)". This module defines
//! that contract and ships one reference implementation (`memory`) used by
//! both daemons when no external store is wired up, and by the test suite.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::StoreError;
use crate::model::{DeviceStatus, ReservedDevice, WorkerRecord};

/// A worker losing its heartbeat: the reservation that must be failed and
/// the client that owned it. Mirrors `handleWorkerTimeouts` in spec.md §6.
#[derive(Debug, Clone)]
pub struct WorkerTimeoutRow {
    pub serial: String,
    pub client_id: String,
    pub worker_name: String,
}

/// A reservation that has passed `expires_at`. Mirrors
/// `handleReservationTimeouts` in spec.md §6.
#[derive(Debug, Clone)]
pub struct ReservationTimeoutRow {
    pub serial: String,
    pub client_id: String,
    pub worker_ip: String,
    pub worker_port: u16,
}

/// Result of ending a reservation: enough to tell the owning worker to
/// unreserve. Mirrors `endReservations`/`endAllReservations`.
#[derive(Debug, Clone)]
pub struct EndedReservation {
    pub serial: String,
    pub worker_ip: String,
    pub worker_port: u16,
}

/// A device that was hosted by a worker which has been removed, along with
/// the client that currently held it (if any), so the caller can notify
/// both sides. Mirrors `removeWorker`.
#[derive(Debug, Clone)]
pub struct OrphanedDevice {
    pub serial: String,
    pub client_id: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn add_worker(&self, name: &str, ip: &str, port: u16) -> Result<(), StoreError>;

    /// Removes a worker and everything it hosted. Returns the devices that
    /// were orphaned, so the caller can notify their clients of `failure`.
    async fn remove_worker(&self, name: &str) -> Result<Vec<OrphanedDevice>, StoreError>;

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError>;

    async fn add_device(&self, serial: &str, worker_name: &str) -> Result<(), StoreError>;

    async fn update_device_status(&self, serial: &str, status: DeviceStatus) -> Result<(), StoreError>;

    /// Transactionally selects up to `amount` available devices, marks them
    /// reserved, and returns their worker routing info. `reserve_for` is
    /// `T_reserve` (spec.md §9 OQ2).
    async fn make_reservations(
        &self,
        amount: u32,
        client_id: &str,
        kind: &str,
        args: Value,
        reserve_for: Duration,
    ) -> Result<Vec<ReservedDevice>, StoreError>;

    /// Shifts `expires_at` forward by `extend_by` for the named serials,
    /// owned by `client_id`. Returns the serials actually extended.
    async fn extend_reservations(
        &self,
        client_id: &str,
        serials: &[String],
        extend_by: Duration,
    ) -> Result<Vec<String>, StoreError>;

    async fn extend_all_reservations(
        &self,
        client_id: &str,
        extend_by: Duration,
    ) -> Result<Vec<String>, StoreError>;

    async fn end_reservations(
        &self,
        client_id: &str,
        serials: &[String],
    ) -> Result<Vec<EndedReservation>, StoreError>;

    async fn end_all_reservations(&self, client_id: &str) -> Result<Vec<EndedReservation>, StoreError>;

    async fn heartbeat_worker(&self, name: &str) -> Result<(), StoreError>;

    /// Workers with no heartbeat within `timeout` get every reservation
    /// they host failed.
    async fn handle_worker_timeouts(&self, timeout: Duration) -> Result<Vec<WorkerTimeoutRow>, StoreError>;

    async fn handle_reservation_timeouts(&self) -> Result<Vec<ReservationTimeoutRow>, StoreError>;

    /// Serials whose reservation expires within `notify_within`.
    async fn get_reservations_ending_soon(&self, notify_within: Duration) -> Result<Vec<String>, StoreError>;

    async fn get_device_worker(&self, serial: &str) -> Result<Option<(String, u16)>, StoreError>;

    /// The `client_id` of the current reservation of `serial`, if any.
    async fn get_device_callback(&self, serial: &str) -> Result<Option<String>, StoreError>;
}
