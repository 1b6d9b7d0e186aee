//! The four periodic loops, grounded on `Heartbeat.py`: poll workers for a
//! heartbeat, detect worker timeouts, detect reservation timeouts, and warn
//! clients of reservations ending soon. The original runs each as a
//! `schedule`-driven thread; here each is a `tokio::time::interval` loop
//! spawned once at startup and kept alive for the process lifetime.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info};

use crate::event_router::EventRouter;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub heartbeat_poll: Duration,
    pub timeout_poll: Duration,
    pub timeout_duration: Duration,
    pub reservation_poll: Duration,
    pub reservation_expiring_poll: Duration,
    pub reservation_notify_at: Duration,
}

pub struct HeartbeatScheduler {
    store: Arc<dyn Store>,
    event_router: Arc<EventRouter>,
    http: reqwest::Client,
    config: HeartbeatConfig,
}

impl HeartbeatScheduler {
    pub fn new(store: Arc<dyn Store>, event_router: Arc<EventRouter>, config: HeartbeatConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            event_router,
            http: reqwest::Client::new(),
            config,
        })
    }

    /// Spawns all four loops. Returns their join handles so the caller can
    /// keep them alive for the process lifetime.
    pub fn spawn_all(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.clone().spawn_heartbeat_workers(),
            self.clone().spawn_worker_timeouts(),
            self.clone().spawn_reservation_timeouts(),
            self.clone().spawn_reservation_ending_soon(),
        ]
    }

    fn spawn_heartbeat_workers(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.heartbeat_poll);
            loop {
                ticker.tick().await;
                self.heartbeat_workers_once().await;
            }
        })
    }

    async fn heartbeat_workers_once(&self) {
        let workers = match self.store.list_workers().await {
            Ok(workers) => workers,
            Err(err) => {
                error!(%err, "failed to list workers for heartbeat");
                return;
            }
        };

        for worker in workers {
            let url = format!("http://{}:{}/heartbeat", worker.ip, worker.server_port);
            let ok = self
                .http
                .get(&url)
                .timeout(Duration::from_secs(10))
                .send()
                .await
                .is_ok_and(|res| res.status().is_success());

            if ok {
                if let Err(err) = self.store.heartbeat_worker(&worker.name).await {
                    error!(worker = %worker.name, %err, "failed to persist heartbeat");
                }
            } else {
                error!(worker = %worker.name, "failed heartbeat check");
            }
        }
    }

    fn spawn_worker_timeouts(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.timeout_poll);
            loop {
                ticker.tick().await;
                self.worker_timeouts_once().await;
            }
        })
    }

    async fn worker_timeouts_once(&self) {
        let rows = match self.store.handle_worker_timeouts(self.config.timeout_duration).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(%err, "failed to query worker timeouts");
                return;
            }
        };

        for row in rows {
            self.event_router.send_to_client(&row.client_id, &row.serial, json!({ "event": "failure" })).await;
            info!(worker = %row.worker_name, serial = %row.serial, "worker failed; sent device failure");
        }
    }

    fn spawn_reservation_timeouts(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.reservation_poll);
            loop {
                ticker.tick().await;
                self.reservation_timeouts_once().await;
            }
        })
    }

    async fn reservation_timeouts_once(&self) {
        let rows = match self.store.handle_reservation_timeouts().await {
            Ok(rows) => rows,
            Err(err) => {
                error!(%err, "failed to query reservation timeouts");
                return;
            }
        };

        for row in rows {
            self.event_router
                .send_to_client(&row.client_id, &row.serial, json!({ "event": "reservation end" }))
                .await;

            let url = format!("http://{}:{}/unreserve", row.worker_ip, row.worker_port);
            let body = json!({ "serial": row.serial });
            if let Err(err) = self.http.post(&url).json(&body).timeout(Duration::from_secs(10)).send().await {
                error!(serial = %row.serial, %url, %err, "failed to instruct worker to unreserve");
            }

            info!(serial = %row.serial, client_id = %row.client_id, "reservation ended by timeout");
        }
    }

    fn spawn_reservation_ending_soon(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.reservation_expiring_poll);
            loop {
                ticker.tick().await;
                self.reservation_ending_soon_once().await;
            }
        })
    }

    async fn reservation_ending_soon_once(&self) {
        let serials = match self.store.get_reservations_ending_soon(self.config.reservation_notify_at).await {
            Ok(serials) => serials,
            Err(err) => {
                error!(%err, "failed to query reservations ending soon");
                return;
            }
        };

        for serial in serials {
            self.event_router.send(&serial, json!({ "event": "reservation ending soon" })).await;
            info!(serial, "sent ending soon notification");
        }
    }
}
