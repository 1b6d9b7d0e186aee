//! In-memory reference `Store`. Used by both daemons in single-process
//! demos/tests, and is the only implementation this crate ships - spec.md
//! §1 treats the relational store as an out-of-scope external collaborator,
//! so there is no SQL backend here, only the contract.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{Device, DeviceStatus, Reservation, ReservedDevice, WorkerRecord};

use super::{EndedReservation, OrphanedDevice, ReservationTimeoutRow, Store, WorkerTimeoutRow};

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::zero())
}

#[derive(Default)]
struct Inner {
    workers: HashMap<String, WorkerRecord>,
    devices: HashMap<String, Device>,
    /// Keyed by device serial - at most one active reservation per device
    /// (the exclusivity invariant of spec.md §3/§8).
    reservations: HashMap<String, Reservation>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Introspection helper for callers that hold the concrete store rather
    /// than `dyn Store` - notably the test suite, which has no other way to
    /// observe a device's persisted status.
    pub async fn device_status(&self, serial: &str) -> Option<DeviceStatus> {
        self.inner.lock().await.devices.get(serial).map(|d| d.status)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_worker(&self, name: &str, ip: &str, port: u16) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.workers.insert(
            name.to_string(),
            WorkerRecord {
                name: name.to_string(),
                ip: ip.to_string(),
                server_port: port,
                last_heartbeat: Some(Utc::now()),
            },
        );
        Ok(())
    }

    async fn remove_worker(&self, name: &str) -> Result<Vec<OrphanedDevice>, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.workers.remove(name).is_none() {
            return Err(StoreError::UnknownWorker(name.to_string()));
        }

        let serials: Vec<String> = inner
            .devices
            .values()
            .filter(|d| d.worker_name == name)
            .map(|d| d.serial.clone())
            .collect();

        let mut orphans = Vec::new();
        for serial in serials {
            inner.devices.remove(&serial);
            let client_id = inner.reservations.remove(&serial).map(|r| r.client_id);
            orphans.push(OrphanedDevice { serial, client_id });
        }
        Ok(orphans)
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        Ok(self.inner.lock().await.workers.values().cloned().collect())
    }

    async fn add_device(&self, serial: &str, worker_name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.workers.contains_key(worker_name) {
            return Err(StoreError::UnknownWorker(worker_name.to_string()));
        }
        inner.devices.entry(serial.to_string()).or_insert_with(|| Device {
            serial: serial.to_string(),
            worker_name: worker_name.to_string(),
            status: DeviceStatus::AwaitFlashDefault,
            bus_id: None,
        });
        Ok(())
    }

    async fn update_device_status(&self, serial: &str, status: DeviceStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let device = inner
            .devices
            .get_mut(serial)
            .ok_or_else(|| StoreError::UnknownDevice(serial.to_string()))?;
        device.status = status;
        Ok(())
    }

    async fn make_reservations(
        &self,
        amount: u32,
        client_id: &str,
        kind: &str,
        args: Value,
        reserve_for: Duration,
    ) -> Result<Vec<ReservedDevice>, StoreError> {
        let mut inner = self.inner.lock().await;

        // Deterministic by serial ordering (spec.md §4.5: "fairness across
        // clients is not required").
        let mut available: Vec<String> = inner
            .devices
            .values()
            .filter(|d| d.status == DeviceStatus::Available)
            .map(|d| d.serial.clone())
            .collect();
        available.sort();
        available.truncate(amount as usize);

        let now = Utc::now();
        let expires_at = now + to_chrono(reserve_for);

        let mut out = Vec::with_capacity(available.len());
        for serial in available {
            let (worker_name, status) = {
                let device = inner.devices.get_mut(&serial).expect("just selected");
                device.status = DeviceStatus::Reserved;
                (device.worker_name.clone(), device.status)
            };
            debug_assert_eq!(status, DeviceStatus::Reserved);

            inner.reservations.insert(
                serial.clone(),
                Reservation {
                    device_serial: serial.clone(),
                    client_id: client_id.to_string(),
                    created_at: now,
                    expires_at,
                    kind: Some(kind.to_string()),
                    args: Some(args.clone()),
                },
            );

            let worker = inner
                .workers
                .get(&worker_name)
                .ok_or_else(|| StoreError::UnknownWorker(worker_name.clone()))?;

            out.push(ReservedDevice {
                serial,
                ip: worker.ip.clone(),
                server_port: worker.server_port,
            });
        }

        Ok(out)
    }

    async fn extend_reservations(
        &self,
        client_id: &str,
        serials: &[String],
        extend_by: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        let delta = to_chrono(extend_by);
        let mut extended = Vec::new();
        for serial in serials {
            if let Some(reservation) = inner.reservations.get_mut(serial) {
                if reservation.client_id == client_id {
                    reservation.expires_at += delta;
                    extended.push(serial.clone());
                }
            }
        }
        Ok(extended)
    }

    async fn extend_all_reservations(
        &self,
        client_id: &str,
        extend_by: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        let delta = to_chrono(extend_by);
        let mut extended = Vec::new();
        for reservation in inner.reservations.values_mut() {
            if reservation.client_id == client_id {
                reservation.expires_at += delta;
                extended.push(reservation.device_serial.clone());
            }
        }
        Ok(extended)
    }

    async fn end_reservations(
        &self,
        client_id: &str,
        serials: &[String],
    ) -> Result<Vec<EndedReservation>, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut ended = Vec::new();
        for serial in serials {
            let owned = inner
                .reservations
                .get(serial)
                .is_some_and(|r| r.client_id == client_id);
            if !owned {
                continue;
            }
            inner.reservations.remove(serial);
            if let Some(device) = inner.devices.get(serial) {
                if let Some(worker) = inner.workers.get(&device.worker_name) {
                    ended.push(EndedReservation {
                        serial: serial.clone(),
                        worker_ip: worker.ip.clone(),
                        worker_port: worker.server_port,
                    });
                }
            }
        }
        Ok(ended)
    }

    async fn end_all_reservations(&self, client_id: &str) -> Result<Vec<EndedReservation>, StoreError> {
        let serials: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .reservations
                .values()
                .filter(|r| r.client_id == client_id)
                .map(|r| r.device_serial.clone())
                .collect()
        };
        self.end_reservations(client_id, &serials).await
    }

    async fn heartbeat_worker(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let worker = inner
            .workers
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownWorker(name.to_string()))?;
        // Monotonicity (spec.md §8): only move forward.
        let now = Utc::now();
        if worker.last_heartbeat.is_none_or(|prev| now > prev) {
            worker.last_heartbeat = Some(now);
        }
        Ok(())
    }

    async fn handle_worker_timeouts(&self, timeout: Duration) -> Result<Vec<WorkerTimeoutRow>, StoreError> {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now() - to_chrono(timeout);

        let dead_workers: Vec<String> = inner
            .workers
            .values()
            .filter(|w| w.last_heartbeat.is_none_or(|hb| hb < cutoff))
            .map(|w| w.name.clone())
            .collect();

        let mut rows = Vec::new();
        for worker_name in dead_workers {
            let serials: Vec<String> = inner
                .devices
                .values()
                .filter(|d| d.worker_name == worker_name)
                .map(|d| d.serial.clone())
                .collect();

            for serial in serials {
                if let Some(reservation) = inner.reservations.remove(&serial) {
                    rows.push(WorkerTimeoutRow {
                        serial,
                        client_id: reservation.client_id,
                        worker_name: worker_name.clone(),
                    });
                }
            }
        }

        Ok(rows)
    }

    async fn handle_reservation_timeouts(&self) -> Result<Vec<ReservationTimeoutRow>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let expired: Vec<String> = inner
            .reservations
            .values()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.device_serial.clone())
            .collect();

        let mut rows = Vec::new();
        for serial in expired {
            let reservation = match inner.reservations.remove(&serial) {
                Some(r) => r,
                None => continue,
            };
            let Some(device) = inner.devices.get(&serial) else {
                continue;
            };
            let Some(worker) = inner.workers.get(&device.worker_name) else {
                continue;
            };
            rows.push(ReservationTimeoutRow {
                serial,
                client_id: reservation.client_id,
                worker_ip: worker.ip.clone(),
                worker_port: worker.server_port,
            });
        }

        Ok(rows)
    }

    async fn get_reservations_ending_soon(&self, notify_within: Duration) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let threshold = Utc::now() + to_chrono(notify_within);
        Ok(inner
            .reservations
            .values()
            .filter(|r| r.expires_at <= threshold)
            .map(|r| r.device_serial.clone())
            .collect())
    }

    async fn get_device_worker(&self, serial: &str) -> Result<Option<(String, u16)>, StoreError> {
        let inner = self.inner.lock().await;
        let Some(device) = inner.devices.get(serial) else {
            return Ok(None);
        };
        Ok(inner
            .workers
            .get(&device.worker_name)
            .map(|w| (w.ip.clone(), w.server_port)))
    }

    async fn get_device_callback(&self, serial: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.reservations.get(serial).map(|r| r.client_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_worker("w1", "10.0.0.1", 8081).await.unwrap();
        store.add_device("AAA", "w1").await.unwrap();
        store.add_device("BBB", "w1").await.unwrap();
        store.update_device_status("AAA", DeviceStatus::Available).await.unwrap();
        store.update_device_status("BBB", DeviceStatus::Available).await.unwrap();
        store
    }

    #[tokio::test]
    async fn reserve_respects_amount_and_exclusivity() {
        let store = fixture().await;
        let reserved = store
            .make_reservations(1, "clientA", "usbip", Value::Null, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(reserved.len(), 1);

        // The same device cannot be reserved twice.
        let reserved2 = store
            .make_reservations(2, "clientB", "usbip", Value::Null, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(reserved2.len(), 1);
        assert_ne!(reserved[0].serial, reserved2[0].serial);
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let store = fixture().await;
        let reserved = store
            .make_reservations(1, "clientA", "usbip", Value::Null, Duration::from_secs(3600))
            .await
            .unwrap();
        let serial = reserved[0].serial.clone();

        let ended1 = store.end_reservations("clientA", &[serial.clone()]).await.unwrap();
        assert_eq!(ended1.len(), 1);

        let ended2 = store.end_reservations("clientA", &[serial]).await.unwrap();
        assert!(ended2.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_is_monotonic() {
        let store = fixture().await;
        store.heartbeat_worker("w1").await.unwrap();
        let first = store.list_workers().await.unwrap()[0].last_heartbeat;
        store.heartbeat_worker("w1").await.unwrap();
        let second = store.list_workers().await.unwrap()[0].last_heartbeat;
        assert!(second >= first);
    }

    #[tokio::test]
    async fn extend_shifts_forward_from_current_expiry() {
        let store = fixture().await;
        let reserved = store
            .make_reservations(1, "clientA", "usbip", Value::Null, Duration::from_secs(60))
            .await
            .unwrap();
        let serial = reserved[0].serial.clone();

        let before = store.get_reservations_ending_soon(Duration::from_secs(3600)).await.unwrap();
        assert!(before.contains(&serial));

        let extended = store
            .extend_reservations("clientA", &[serial.clone()], Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(extended, vec![serial.clone()]);

        let soon = store.get_reservations_ending_soon(Duration::from_secs(60)).await.unwrap();
        assert!(!soon.contains(&serial));
    }
}
