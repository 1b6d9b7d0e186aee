//! `ReadyState`, grounded on
//! `examples/original_source/src/usbipice/worker/device/state/core/ReadyState.py`.
//! Persists `available` and otherwise waits to be reserved.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::model::DeviceStatus;
use crate::worker::device::DeviceContext;

use super::DeviceState;

pub struct ReadyState;

impl ReadyState {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceState for ReadyState {
    fn name(&self) -> &'static str {
        "Ready"
    }

    async fn start(&self, ctx: &Arc<DeviceContext>) {
        if let Err(err) = ctx.store.update_device_status(&ctx.serial, DeviceStatus::Available).await {
            warn!(serial = %ctx.serial, %err, "failed to persist available status");
        }
    }
}
