//! `TestState`, grounded on
//! `examples/original_source/src/usbipice/worker/device/state/core/TestState.py`.
//! Persists `testing`, starts a 30s broken-timeout, and on the first `add`
//! with a `DEVNAME`, reads the node and expects `"default firmware"` within
//! 2s before switching to Ready; a mismatch switches to Broken immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::model::{DeviceProperties, DeviceStatus};
use crate::worker::device::DeviceContext;

use super::{DeviceState, Transition};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

pub struct TestState {
    exited: Mutex<bool>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
    timed_out: Arc<AtomicBool>,
}

impl TestState {
    pub fn new() -> Self {
        Self {
            exited: Mutex::new(false),
            timeout_task: Mutex::new(None),
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl DeviceState for TestState {
    fn name(&self) -> &'static str {
        "Test"
    }

    async fn start(&self, ctx: &Arc<DeviceContext>) {
        if let Err(err) = ctx.store.update_device_status(&ctx.serial, DeviceStatus::Testing).await {
            warn!(serial = %ctx.serial, %err, "failed to persist testing status");
        }

        let ctx_clone = ctx.clone();
        let timed_out = self.timed_out.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(TEST_TIMEOUT).await;
            timed_out.store(true, Ordering::SeqCst);
            ctx_clone.force_switch(Transition::Broken).await;
        });
        *self.timeout_task.lock().await = Some(handle);
    }

    async fn handle_add(&self, ctx: &Arc<DeviceContext>, dev: &DeviceProperties) {
        let Some(path) = dev.get("DEVNAME") else {
            warn!(serial = %ctx.serial, "add event with no devname");
            return;
        };

        let mut exited = self.exited.lock().await;
        if *exited {
            return;
        }
        *exited = true;
        drop(exited);

        if let Some(handle) = self.timeout_task.lock().await.take() {
            handle.abort();
        }

        if ctx.adapter.verify_default_firmware(path, VERIFY_TIMEOUT).await {
            ctx.request_switch(Transition::Ready).await;
        } else {
            warn!(serial = %ctx.serial, "device did not read back as running the default firmware");
            ctx.request_switch(Transition::Broken).await;
        }
    }

    async fn handle_exit(&self, _ctx: &Arc<DeviceContext>) {
        // See `FlashState::handle_exit`: when the timeout itself fired,
        // this runs on the timeout task's own stack.
        if self.timed_out.load(Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.timeout_task.lock().await.take() {
            handle.abort();
        }
    }
}
