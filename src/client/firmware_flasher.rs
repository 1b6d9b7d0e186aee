//! Client-side bulk firmware flasher (spec.md §4.9), grounded on
//! `examples/original_source/client/FirmwareFlasher.py`. Queues serials for
//! flashing, watches for their bootloader partition to appear, and copies
//! the given firmware onto it - the same bootloader-trigger/mount/copy
//! primitives `worker::state::flash` uses, run directly against devices
//! attached to the client's own host rather than a worker's.
//!
//! The original drives this off a netlink device monitor; this crate polls
//! `device_adapter::linux::enumerate_devices` instead, for the same reason
//! `DeviceManager::scan` does.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, error};

use crate::device_adapter::linux::{enumerate_devices, FsFirmwareIo};
use crate::device_adapter::{has_exact_bootloader_markers, DeviceAdapter, FirmwareIo};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MOUNT_ROOT: &str = "client_media";

/// A device is "failed" only once mount succeeded but the upload past it
/// didn't; a mount failure leaves it "remaining" for the next poll to retry
/// (spec.md §4.9).
enum UploadOutcome {
    Done,
    MountFailed,
    Failed,
}

#[derive(Default)]
struct Inner {
    remaining: HashMap<String, PathBuf>,
    uploading: HashSet<String>,
    failed: Vec<String>,
}

pub struct FirmwareFlasher {
    adapter: crate::device_adapter::linux::LinuxDeviceAdapter,
    firmware_io: FsFirmwareIo,
    inner: Mutex<Inner>,
    idle: Notify,
}

impl Default for FirmwareFlasher {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareFlasher {
    pub fn new() -> Self {
        Self {
            adapter: crate::device_adapter::linux::LinuxDeviceAdapter,
            firmware_io: FsFirmwareIo,
            inner: Mutex::new(Inner::default()),
            idle: Notify::new(),
        }
    }

    pub fn spawn_poll_loop(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let flasher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                flasher.poll_once().await;
            }
        })
    }

    /// Queues `serials` to be flashed with `firmware_path`, and immediately
    /// bootloader-triggers any already-attached matching tty interfaces.
    pub async fn flash(&self, serials: &[String], firmware_path: &str) {
        {
            let mut inner = self.inner.lock().await;
            for serial in serials {
                inner.remaining.insert(serial.clone(), PathBuf::from(firmware_path));
            }
        }

        for serial in serials {
            for dev in self.adapter.known_devices(serial).await {
                if dev.get("SUBSYSTEM").map(String::as_str) == Some("tty") {
                    if let Some(devname) = dev.get("DEVNAME") {
                        self.adapter.send_bootloader(devname).await;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) {
        let discovered = enumerate_devices().await;
        for (serial, dev) in discovered {
            let tracked = {
                let inner = self.inner.lock().await;
                inner.remaining.contains_key(&serial)
            };
            if !tracked {
                continue;
            }

            if dev.get("SUBSYSTEM").map(String::as_str) == Some("tty") {
                if let Some(devname) = dev.get("DEVNAME") {
                    debug!(serial, "sending bootloader signal");
                    self.adapter.send_bootloader(devname).await;
                }
                continue;
            }

            if dev.get("DEVTYPE").map(String::as_str) != Some("partition") {
                continue;
            }

            let Some(devname) = dev.get("DEVNAME").cloned() else { continue };
            self.upload_one(serial, devname).await;
        }
    }

    async fn upload_one(&self, serial: String, devname: String) {
        let firmware_path = {
            let mut inner = self.inner.lock().await;
            let Some(path) = inner.remaining.remove(&serial) else { return };
            inner.uploading.insert(serial.clone());
            path
        };

        let mount_path = PathBuf::from(MOUNT_ROOT).join(&serial);
        let _ = tokio::fs::create_dir_all(&mount_path).await;
        let mount_path_str = mount_path.to_string_lossy().into_owned();

        let outcome = self.try_upload(&devname, &mount_path_str, &firmware_path).await;

        let mut inner = self.inner.lock().await;
        inner.uploading.remove(&serial);
        match outcome {
            UploadOutcome::Done => {}
            // Mount itself never got a chance to run the upload - leave the
            // serial queued so the next poll retries it on the next add.
            UploadOutcome::MountFailed => {
                debug!(serial, "mount failed, leaving queued for retry");
                inner.remaining.insert(serial, firmware_path);
            }
            UploadOutcome::Failed => {
                error!(serial, "failed to flash device");
                inner.failed.push(serial);
            }
        }

        if inner.remaining.is_empty() && inner.uploading.is_empty() {
            drop(inner);
            self.idle.notify_waiters();
        }
    }

    async fn try_upload(&self, devname: &str, mount_path: &str, firmware_path: &PathBuf) -> UploadOutcome {
        if self.firmware_io.mount(devname, mount_path).await.is_err() {
            return UploadOutcome::MountFailed;
        }

        let entries = self.firmware_io.list_dir(mount_path).await.unwrap_or_default();
        let marker_ok = has_exact_bootloader_markers(&entries);
        let copied = marker_ok && self.firmware_io.copy_firmware(&firmware_path.to_string_lossy(), mount_path).await.is_ok();

        let _ = self.firmware_io.unmount(mount_path).await;

        if copied {
            UploadOutcome::Done
        } else {
            UploadOutcome::Failed
        }
    }

    /// Blocks until every queued serial has finished (or failed), or
    /// `timeout` elapses. Returns `(remaining, failed)`.
    pub async fn wait_until_finished(&self, timeout: Option<Duration>) -> (Vec<String>, Vec<String>) {
        loop {
            {
                let inner = self.inner.lock().await;
                if inner.remaining.is_empty() && inner.uploading.is_empty() {
                    break;
                }
            }

            let wait = self.idle.notified();
            match timeout {
                Some(timeout) => {
                    if tokio::time::timeout(timeout, wait).await.is_err() {
                        break;
                    }
                }
                None => wait.await,
            }
        }

        let mut inner = self.inner.lock().await;
        let remaining = inner.remaining.keys().cloned().collect();
        let failed = std::mem::take(&mut inner.failed);
        (remaining, failed)
    }
}
