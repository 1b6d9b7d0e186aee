//! `FlashState`, grounded on
//! `examples/original_source/src/usbipice/worker/device/state/core/FlashState.py`.
//! On entry replays known device nodes; on a `tty` add sends the
//! bootloader trigger; on a `partition` add, mounts/verifies/copies/
//! unmounts, switching onward on success or to Broken on failure or
//! timeout.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::model::DeviceProperties;
use crate::worker::device::DeviceContext;

use super::{DeviceState, Transition};

pub struct FlashState {
    firmware_path: PathBuf,
    next: Transition,
    timeout: Option<Duration>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
    timed_out: Arc<AtomicBool>,
}

impl FlashState {
    pub fn new(firmware_path: PathBuf, next: Transition, timeout: Option<Duration>) -> Self {
        Self {
            firmware_path,
            next,
            timeout,
            timeout_task: Mutex::new(None),
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl DeviceState for FlashState {
    fn name(&self) -> &'static str {
        "Flash"
    }

    async fn start(&self, ctx: &Arc<DeviceContext>) {
        if let Some(timeout) = self.timeout {
            let ctx = ctx.clone();
            let timed_out = self.timed_out.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timed_out.store(true, Ordering::SeqCst);
                error!(serial = %ctx.serial, "flash timed out, switching to broken");
                ctx.force_switch(Transition::Broken).await;
            });
            *self.timeout_task.lock().await = Some(handle);
        }

        let devs = ctx.adapter.known_devices(&ctx.serial).await;
        for dev in devs {
            self.handle_add(ctx, &dev).await;
        }
    }

    async fn handle_add(&self, ctx: &Arc<DeviceContext>, dev: &DeviceProperties) {
        let Some(devname) = dev.get("DEVNAME") else {
            warn!(serial = %ctx.serial, "add event with no devname");
            return;
        };

        if dev.get("SUBSYSTEM").map(String::as_str) == Some("tty") {
            debug!(serial = %ctx.serial, "sending bootloader signal");
            ctx.adapter.send_bootloader(devname).await;
            return;
        }

        if dev.get("DEVTYPE").map(String::as_str) != Some("partition") {
            return;
        }

        debug!(serial = %ctx.serial, "found bootloader candidate");

        let mount_path = ctx.mount_path.to_string_lossy().into_owned();
        match upload_firmware(ctx, devname, &mount_path, &self.firmware_path).await {
            UploadOutcome::Done => ctx.request_switch(self.next.clone()).await,
            UploadOutcome::Retry => debug!(serial = %ctx.serial, "no bootloader partition yet, retrying on next add"),
            UploadOutcome::Failed => {
                error!(serial = %ctx.serial, "failed to upload firmware");
                ctx.request_switch(Transition::Broken).await;
            }
        }
    }

    async fn handle_exit(&self, _ctx: &Arc<DeviceContext>) {
        // If the timeout itself fired, this exit runs on the timeout task's
        // own stack - aborting its own `JoinHandle` would cancel it at the
        // next await point, before the switch it just requested lands.
        if self.timed_out.load(Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.timeout_task.lock().await.take() {
            handle.abort();
        }
    }
}

/// Whether a `partition` add produced a flashable bootloader drive. Marker
/// mismatch is a `Retry`, not a `Failed` - spec.md §8 scenario 3 expects
/// this add to be silently retried on the next one rather than bricking
/// the device. Only the wall-clock timeout or an actual copy failure
/// switches to Broken.
enum UploadOutcome {
    Done,
    Retry,
    Failed,
}

async fn upload_firmware(ctx: &Arc<DeviceContext>, devnode: &str, mount_path: &str, firmware_path: &PathBuf) -> UploadOutcome {
    if ctx.firmware_io.mount(devnode, mount_path).await.is_err() {
        return UploadOutcome::Retry;
    }

    let entries = match ctx.firmware_io.list_dir(mount_path).await {
        Ok(entries) => entries,
        Err(_) => {
            let _ = ctx.firmware_io.unmount(mount_path).await;
            return UploadOutcome::Retry;
        }
    };

    if !crate::device_adapter::has_exact_bootloader_markers(&entries) {
        let _ = ctx.firmware_io.unmount(mount_path).await;
        return UploadOutcome::Retry;
    }

    let copied = ctx.firmware_io.copy_firmware(&firmware_path.to_string_lossy(), mount_path).await;
    let _ = ctx.firmware_io.unmount(mount_path).await;

    if copied.is_ok() {
        UploadOutcome::Done
    } else {
        UploadOutcome::Failed
    }
}
