//! Client-side usbip connection watchdog (spec.md §4.8), grounded on
//! `examples/original_source/client/TimeoutDetector.py`. The original polls
//! `usbip port` locally and tracks device events via a netlink monitor; this
//! crate has no client-side netlink binding, so it polls `usbip port`
//! exclusively and relies on `export`/`disconnect` socket events (rather
//! than local udev add events) to reset the per-device activity clock.
//!
//! On a detected timeout it asks the hosting worker to `unbind`, the same
//! corrective action `UsbipBaseClient.unbind` exposes, forcing a fresh
//! `bind`/export on the worker's next device-add.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::client::api::BaseApi;
use crate::client::event_server::SocketEventServer;
use crate::client::handlers::EventHandler;
use crate::device_adapter::linux::LinuxDeviceAdapter;
use crate::device_adapter::DeviceAdapter;

struct Tracked {
    ip: String,
    bus: String,
    last_event: Instant,
}

pub struct TimeoutDetectorConfig {
    pub poll: Duration,
    pub timeout: Duration,
}

impl Default for TimeoutDetectorConfig {
    fn default() -> Self {
        Self { poll: Duration::from_secs(4), timeout: Duration::from_secs(15) }
    }
}

pub struct TimeoutDetector {
    api: Arc<BaseApi>,
    event_server: Arc<SocketEventServer>,
    adapter: LinuxDeviceAdapter,
    config: TimeoutDetectorConfig,
    devices: Mutex<HashMap<String, Tracked>>,
}

impl TimeoutDetector {
    pub fn new(api: Arc<BaseApi>, event_server: Arc<SocketEventServer>, config: TimeoutDetectorConfig) -> Arc<Self> {
        Arc::new(Self {
            api,
            event_server,
            adapter: LinuxDeviceAdapter,
            config,
            devices: Mutex::new(HashMap::new()),
        })
    }

    pub fn spawn_poll_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let detector = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(detector.config.poll);
            loop {
                ticker.tick().await;
                detector.poll_once().await;
            }
        })
    }

    async fn poll_once(&self) {
        let listing = self.adapter.port_listing().await;
        let now = Instant::now();

        let mut timed_out = Vec::new();
        {
            let mut devices = self.devices.lock().await;
            for (serial, tracked) in devices.iter_mut() {
                let still_present = listing.get(&tracked.ip).is_some_and(|buses| buses.contains(&tracked.bus));
                if still_present {
                    tracked.last_event = now;
                } else if now.duration_since(tracked.last_event) > self.config.timeout {
                    timed_out.push(serial.clone());
                    tracked.last_event = now + self.config.timeout;
                }
            }
        }

        for serial in timed_out {
            let Some(info) = self.api.connection_info(&serial) else { continue };
            warn!(serial, "device timed out, requesting re-export");
            self.event_server.send_worker(&info.url(), &serial, "unbind", serde_json::json!({})).await;
        }
    }
}

#[async_trait]
impl EventHandler for TimeoutDetector {
    async fn handle(&self, serial: &str, contents: &Value) {
        let event = contents.get("event").and_then(Value::as_str).unwrap_or_default();
        match event {
            "export" => {
                let Some(bus) = contents.get("busid").and_then(Value::as_str) else { return };
                let ip = contents.get("server_ip").and_then(Value::as_str).unwrap_or_default();
                let mut devices = self.devices.lock().await;
                devices
                    .entry(serial.to_string())
                    .and_modify(|tracked| {
                        tracked.bus = bus.to_string();
                        tracked.last_event = Instant::now();
                    })
                    .or_insert_with(|| Tracked { ip: ip.to_string(), bus: bus.to_string(), last_event: Instant::now() });
            }
            "reservation end" | "failure" => {
                self.devices.lock().await.remove(serial);
            }
            _ => {}
        }
    }
}
