//! The worker daemon: `DeviceManager`, grounded on
//! `examples/original_source/src/usbipice/worker/device/DeviceManager.py`.
//! Tracks one `Device` per serial ever seen, routes device events, reserve
//! /unreserve/request calls, and periodically scans for newly-connected
//! hardware.

pub mod device;
pub mod reservable_registry;
pub mod server;
pub mod state;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::device_adapter::{DeviceAdapter, FirmwareIo};
use crate::event_router::EventRouter;
use crate::model::{DeviceEventAction, DeviceProperties};
use crate::store::Store;

use device::Device;

const SCAN_INTERVAL: Duration = Duration::from_secs(5);

pub struct DeviceManager {
    config: Arc<WorkerConfig>,
    adapter: Arc<dyn DeviceAdapter>,
    firmware_io: Arc<dyn FirmwareIo>,
    store: Arc<dyn Store>,
    event_router: Arc<EventRouter>,
    devices: Mutex<HashMap<String, Arc<Device>>>,
}

impl DeviceManager {
    pub fn new(
        config: Arc<WorkerConfig>,
        adapter: Arc<dyn DeviceAdapter>,
        firmware_io: Arc<dyn FirmwareIo>,
        store: Arc<dyn Store>,
        event_router: Arc<EventRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            adapter,
            firmware_io,
            store,
            event_router,
            devices: Mutex::new(HashMap::new()),
        })
    }

    /// Spawns the periodic device-discovery poll. Returns the join handle
    /// so the caller can keep it alive for the process lifetime.
    pub fn spawn_scan_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                manager.scan().await;
                tokio::time::sleep(SCAN_INTERVAL).await;
            }
        })
    }

    async fn scan(self: &Arc<Self>) {
        let discovered = crate::device_adapter::linux::enumerate_devices().await;
        for (serial, props) in discovered {
            self.handle_dev_event(DeviceEventAction::Add, serial, props).await;
        }
    }

    async fn get_or_create_device(self: &Arc<Self>, serial: &str) -> Arc<Device> {
        let mut devices = self.devices.lock().await;
        if let Some(existing) = devices.get(serial) {
            return existing.clone();
        }

        if let Err(err) = self.store.add_device(serial, &self.config.resolved_worker_name()).await {
            warn!(serial, %err, "failed to register device with store");
        }

        let device = Device::new(
            serial.to_string(),
            self.adapter.clone(),
            self.firmware_io.clone(),
            self.store.clone(),
            self.event_router.clone(),
            self.config.clone(),
        )
        .await;
        devices.insert(serial.to_string(), device.clone());
        device
    }

    pub async fn handle_dev_event(self: &Arc<Self>, action: DeviceEventAction, serial: String, dev: DeviceProperties) {
        let device = self.get_or_create_device(&serial).await;
        device.handle_device_event(action, dev).await;
    }

    pub async fn reserve(self: &Arc<Self>, serial: &str, kind: &str, args: Value) -> bool {
        let devices = self.devices.lock().await;
        let Some(device) = devices.get(serial).cloned() else {
            warn!(serial, "device reserved but does not exist");
            return false;
        };
        drop(devices);
        device.handle_reserve(kind, args).await
    }

    pub async fn unreserve(self: &Arc<Self>, serial: &str) -> bool {
        let devices = self.devices.lock().await;
        let Some(device) = devices.get(serial).cloned() else {
            return false;
        };
        drop(devices);
        device.handle_unreserve().await
    }

    pub async fn handle_request(self: &Arc<Self>, serial: &str, event: &str, json: &Value) -> Option<Value> {
        let devices = self.devices.lock().await;
        let device = devices.get(serial).cloned();
        drop(devices);

        match device {
            Some(device) => device.handle_request(event, json).await,
            None => {
                warn!(serial, event, "request for unknown device");
                None
            }
        }
    }

    pub async fn on_exit(self: &Arc<Self>) {
        let devices = self.devices.lock().await;
        for device in devices.values() {
            device.handle_exit().await;
        }
        info!("device manager exiting");
    }
}
