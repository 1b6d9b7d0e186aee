//! `BrokenState`, grounded on
//! `examples/original_source/src/usbipice/worker/device/state/core/BrokenState.py`.
//! Persists `broken` and emits `failure` to any subscriber.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, warn};

use crate::model::DeviceStatus;
use crate::worker::device::DeviceContext;

use super::DeviceState;

pub struct BrokenState;

impl BrokenState {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceState for BrokenState {
    fn name(&self) -> &'static str {
        "Broken"
    }

    async fn start(&self, ctx: &Arc<DeviceContext>) {
        if let Err(err) = ctx.store.update_device_status(&ctx.serial, DeviceStatus::Broken).await {
            warn!(serial = %ctx.serial, %err, "failed to persist broken status");
        }
        error!(serial = %ctx.serial, "device is broken");
        ctx.send_event(json!({ "event": "failure", "serial": ctx.serial })).await;
    }
}
