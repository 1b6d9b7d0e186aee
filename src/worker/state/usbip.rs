//! `UsbipState`, the `usbip` reservable, grounded on
//! `examples/original_source/src/usbipice/worker/device/state/reservable/UsbipState.py`.
//! Binds a busid for USB-over-IP export on `add`, emits `export`/
//! `disconnect`, and exposes an `unbind` socket request used by
//! `TimeoutDetector` (spec.md §4.8) to force a re-export.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::model::DeviceProperties;
use crate::worker::device::DeviceContext;

use super::DeviceState;

pub struct UsbipState {
    busid: Mutex<Option<String>>,
}

impl UsbipState {
    pub fn new(_args: Value) -> Self {
        Self { busid: Mutex::new(None) }
    }
}

#[async_trait]
impl DeviceState for UsbipState {
    fn name(&self) -> &'static str {
        "Usbip"
    }

    async fn start(&self, ctx: &Arc<DeviceContext>) {
        let devs = ctx.adapter.known_devices(&ctx.serial).await;
        for dev in devs {
            self.handle_add(ctx, &dev).await;
        }
    }

    async fn handle_add(&self, ctx: &Arc<DeviceContext>, dev: &DeviceProperties) {
        let Some(path) = dev.get("DEVPATH") else {
            return;
        };

        let Some(busid) = crate::device_adapter::parse_busid(path) else {
            warn!(serial = %ctx.serial, devname = ?dev.get("DEVNAME"), "failed to get busid");
            return;
        };

        *self.busid.lock().await = Some(busid.clone());

        if !ctx.adapter.bind(&busid).await {
            warn!(serial = %ctx.serial, busid, "failed to bind device");
            return;
        }

        debug!(serial = %ctx.serial, busid, "now exporting");

        ctx.send_event(json!({
            "event": "export",
            "serial": ctx.serial,
            "busid": busid,
            "usbip_port": ctx.config.virtual_port,
            "server_ip": ctx.config.resolved_virtual_ip(),
        }))
        .await;
    }

    async fn handle_remove(&self, ctx: &Arc<DeviceContext>, dev: &DeviceProperties) {
        let Some(path) = dev.get("DEVPATH") else {
            return;
        };
        let Some(busid) = crate::device_adapter::parse_busid(path) else {
            return;
        };

        if self.busid.lock().await.as_deref() != Some(busid.as_str()) {
            return;
        }

        warn!(serial = %ctx.serial, busid, "disconnected from usbip");
        ctx.send_event(json!({ "event": "disconnect", "serial": ctx.serial })).await;
    }

    async fn handle_request(&self, ctx: &Arc<DeviceContext>, event: &str, _json: &Value) -> Option<Value> {
        if event != "unbind" {
            return None;
        }

        let busid = self.busid.lock().await.clone()?;
        if !ctx.adapter.unbind(&busid).await {
            warn!(serial = %ctx.serial, busid, "failed to unbind on request");
            return Some(json!(false));
        }

        Some(json!(true))
    }

    async fn handle_exit(&self, ctx: &Arc<DeviceContext>) {
        if let Some(busid) = self.busid.lock().await.clone() {
            if !ctx.adapter.unbind(&busid).await {
                warn!(serial = %ctx.serial, busid, "failed to unbind on exit");
            }
        }
    }
}
