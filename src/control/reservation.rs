//! The reservation algorithms: `reserve`/`extend`/`extend_all`/`end`/
//! `end_all`, grounded on `Control.py` (the latest variant per spec.md §9,
//! selected over the legacy `server.py`/`Heartbeat.py` pair since it is the
//! one `app.py` actually wires up).
//!
//! Each call shells out to `Store` for the actual bookkeeping, then notifies
//! the affected workers/clients over HTTP and the socket channel. Worker
//! notification failures are logged and otherwise ignored (spec.md §7: the
//! periodic heartbeat loop is what reconciles state that drifted because a
//! worker missed a notification).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use crate::error::StoreError;
use crate::event_router::EventRouter;
use crate::model::ReservedDevice;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ReservationTimings {
    pub reserve_for: Duration,
    pub extend_by: Duration,
}

pub struct ReservationService {
    store: Arc<dyn Store>,
    event_router: Arc<EventRouter>,
    http: reqwest::Client,
    timings: ReservationTimings,
}

impl ReservationService {
    pub fn new(store: Arc<dyn Store>, event_router: Arc<EventRouter>, timings: ReservationTimings) -> Self {
        Self {
            store,
            event_router,
            http: reqwest::Client::new(),
            timings,
        }
    }

    /// Reserves `amount` devices of `kind` for `client_id`, then best-effort
    /// tells each device's worker to switch it into that reservable. A
    /// worker that doesn't answer keeps the device reserved in the store
    /// regardless - `Control.py::reserve` swallows the notification error
    /// the same way.
    pub async fn reserve(
        &self,
        client_id: &str,
        amount: u32,
        kind: &str,
        args: Value,
    ) -> Result<Vec<ReservedDevice>, StoreError> {
        let reserved = self
            .store
            .make_reservations(amount, client_id, kind, args.clone(), self.timings.reserve_for)
            .await?;

        for device in &reserved {
            let url = format!("http://{}:{}/reserve", device.ip, device.server_port);
            let body = json!({ "serial": device.serial, "kind": kind, "args": args });
            if let Err(err) = self.http.post(&url).json(&body).timeout(Duration::from_secs(5)).send().await {
                warn!(serial = %device.serial, %url, %err, "failed to notify worker of reservation");
            }
        }

        Ok(reserved)
    }

    pub async fn extend(&self, client_id: &str, serials: &[String]) -> Result<Vec<String>, StoreError> {
        self.store.extend_reservations(client_id, serials, self.timings.extend_by).await
    }

    pub async fn extend_all(&self, client_id: &str) -> Result<Vec<String>, StoreError> {
        self.store.extend_all_reservations(client_id, self.timings.extend_by).await
    }

    pub async fn end(&self, client_id: &str, serials: &[String]) -> Result<Vec<String>, StoreError> {
        let ended = self.store.end_reservations(client_id, serials).await?;
        for row in &ended {
            self.notify_end(client_id, &row.serial, &row.worker_ip, row.worker_port).await;
        }
        Ok(ended.into_iter().map(|row| row.serial).collect())
    }

    pub async fn end_all(&self, client_id: &str) -> Result<Vec<String>, StoreError> {
        let ended = self.store.end_all_reservations(client_id).await?;
        for row in &ended {
            self.notify_end(client_id, &row.serial, &row.worker_ip, row.worker_port).await;
        }
        Ok(ended.into_iter().map(|row| row.serial).collect())
    }

    /// Tells the client its reservation ended, then tells the worker to
    /// unreserve the device (flash default, switch to `ready`).
    async fn notify_end(&self, client_id: &str, serial: &str, worker_ip: &str, worker_port: u16) {
        self.event_router
            .send_to_client(client_id, serial, json!({ "event": "reservation end" }))
            .await;

        let url = format!("http://{worker_ip}:{worker_port}/unreserve");
        let body = json!({ "serial": serial });
        if let Err(err) = self.http.post(&url).json(&body).timeout(Duration::from_secs(10)).send().await {
            warn!(serial, %url, %err, "failed to notify worker of reservation end");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceStatus;
    use crate::store::memory::MemoryStore;

    async fn fixture() -> (Arc<dyn Store>, Arc<EventRouter>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.add_worker("w1", "10.0.0.1", 8081).await.unwrap();
        store.add_device("AAA", "w1").await.unwrap();
        store.update_device_status("AAA", DeviceStatus::Available).await.unwrap();
        let router = EventRouter::new(store.clone(), Duration::from_secs(60));
        (store, router)
    }

    #[tokio::test]
    async fn reserve_persists_even_when_worker_is_unreachable() {
        let (store, router) = fixture().await;
        let service = ReservationService::new(
            store.clone(),
            router,
            ReservationTimings { reserve_for: Duration::from_secs(3600), extend_by: Duration::from_secs(3600) },
        );

        let reserved = service.reserve("clientA", 1, "usbip", Value::Null).await.unwrap();
        assert_eq!(reserved.len(), 1);
        assert_eq!(store.get_device_callback("AAA").await.unwrap(), Some("clientA".to_string()));
    }

    #[tokio::test]
    async fn end_is_idempotent_through_the_service() {
        let (store, router) = fixture().await;
        let service = ReservationService::new(
            store.clone(),
            router,
            ReservationTimings { reserve_for: Duration::from_secs(3600), extend_by: Duration::from_secs(3600) },
        );

        service.reserve("clientA", 1, "usbip", Value::Null).await.unwrap();
        let ended = service.end("clientA", &["AAA".to_string()]).await.unwrap();
        assert_eq!(ended, vec!["AAA".to_string()]);

        let ended_again = service.end("clientA", &["AAA".to_string()]).await.unwrap();
        assert!(ended_again.is_empty());
    }
}
