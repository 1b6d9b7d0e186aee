//! `Device` + `DeviceContext`, grounded on
//! `examples/original_source/src/usbipice/worker/device/Device.py`. Owns
//! one device's current state and the shared handles its states need
//! (adapter, firmware I/O, store, event router, config, scratch paths).

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::WorkerConfig;
use crate::device_adapter::{DeviceAdapter, FirmwareIo};
use crate::event_router::EventRouter;
use crate::model::{DeviceEventAction, DeviceProperties, DeviceStatus};
use crate::store::Store;

use super::state::{build_state, DeviceState, Transition};

/// Shared, immutable-after-construction handles plus the one piece of
/// mutable cross-state coordination: the pending transition slot that
/// replaces a reentrant lock (spec.md §9).
pub struct DeviceContext {
    pub serial: String,
    pub adapter: Arc<dyn DeviceAdapter>,
    pub firmware_io: Arc<dyn FirmwareIo>,
    pub store: Arc<dyn Store>,
    pub event_router: Arc<EventRouter>,
    pub config: Arc<WorkerConfig>,
    pub mount_path: PathBuf,
    pub media_path: PathBuf,
    pending_switch: Mutex<Option<Transition>>,
    self_handle: Mutex<Option<Weak<Device>>>,
}

impl DeviceContext {
    pub fn worker_media_root() -> &'static str {
        "worker_media"
    }

    /// Requests a transition. May be called from inside a state's handler
    /// (the original's "switch during handleAdd while holding the device
    /// mutex"); here it just records intent - the owning `Device` performs
    /// the actual swap once the in-flight handler returns.
    pub async fn request_switch(&self, transition: Transition) {
        let mut guard = self.pending_switch.lock().await;
        *guard = Some(transition);
    }

    /// Requests a transition and drains it immediately, for callers with no
    /// device-event cycle of their own to piggyback on: the wall-clock
    /// timeouts `FlashState`/`TestState` spawn in the background (spec.md §8
    /// scenario 3, "if the wall-clock timeout fires first, switch to
    /// Broken"). A plain `request_switch` from there would sit pending
    /// forever since nothing else calls back into the device.
    pub async fn force_switch(&self, transition: Transition) {
        self.request_switch(transition).await;
        let device = self.self_handle.lock().await.as_ref().and_then(Weak::upgrade);
        if let Some(device) = device {
            device.drain_pending_transitions().await;
        }
    }

    async fn take_pending_switch(&self) -> Option<Transition> {
        self.pending_switch.lock().await.take()
    }

    pub async fn send_event(&self, contents: Value) {
        self.event_router.send(&self.serial, contents).await;
    }
}

pub struct Device {
    pub ctx: Arc<DeviceContext>,
    state: Mutex<Option<Box<dyn DeviceState>>>,
}

impl Device {
    pub async fn new(
        serial: String,
        adapter: Arc<dyn DeviceAdapter>,
        firmware_io: Arc<dyn FirmwareIo>,
        store: Arc<dyn Store>,
        event_router: Arc<EventRouter>,
        config: Arc<WorkerConfig>,
    ) -> Arc<Self> {
        let root = PathBuf::from(DeviceContext::worker_media_root()).join(&serial);
        let mount_path = root.join("mount");
        let media_path = root.join("media");
        let _ = tokio::fs::create_dir_all(&mount_path).await;
        let _ = tokio::fs::create_dir_all(&media_path).await;

        let ctx = Arc::new(DeviceContext {
            serial,
            adapter,
            firmware_io,
            store,
            event_router,
            config,
            mount_path,
            media_path,
            pending_switch: Mutex::new(None),
            self_handle: Mutex::new(None),
        });

        let device = Arc::new(Self {
            ctx,
            state: Mutex::new(None),
        });
        *device.ctx.self_handle.lock().await = Some(Arc::downgrade(&device));

        device.flash_default().await;
        device
    }

    async fn drain_pending_transitions(self: &Arc<Self>) {
        loop {
            let Some(transition) = self.ctx.take_pending_switch().await else {
                break;
            };

            let new_state = build_state(transition);
            {
                let mut guard = self.state.lock().await;
                if let Some(outgoing) = guard.take() {
                    outgoing.handle_exit(&self.ctx).await;
                }
                debug!(serial = %self.ctx.serial, state = new_state.name(), "state is now");
                *guard = Some(new_state);
            }

            let guard = self.state.lock().await;
            if let Some(current) = guard.as_ref() {
                current.start(&self.ctx).await;
            }
        }
    }

    async fn flash_default(self: &Arc<Self>) {
        if let Err(err) = self
            .ctx
            .store
            .update_device_status(&self.ctx.serial, DeviceStatus::FlashingDefault)
            .await
        {
            warn!(serial = %self.ctx.serial, %err, "failed to persist flashing_default status");
        }

        let firmware_path = PathBuf::from(&self.ctx.config.default_firmware);
        self.ctx
            .request_switch(Transition::Flash {
                firmware_path,
                next: Box::new(Transition::Test),
                timeout: Some(std::time::Duration::from_secs(60)),
            })
            .await;
        self.drain_pending_transitions().await;
    }

    pub async fn handle_device_event(self: &Arc<Self>, action: DeviceEventAction, dev: DeviceProperties) {
        {
            let guard = self.state.lock().await;
            if let Some(state) = guard.as_ref() {
                match action {
                    DeviceEventAction::Add => state.handle_add(&self.ctx, &dev).await,
                    DeviceEventAction::Remove => state.handle_remove(&self.ctx, &dev).await,
                }
            }
        }
        self.drain_pending_transitions().await;
    }

    pub async fn handle_reserve(self: &Arc<Self>, kind: &str, args: Value) -> bool {
        if !crate::worker::reservable_registry::exists(kind) {
            return false;
        }
        self.ctx
            .request_switch(Transition::Reservable { kind: kind.to_string(), args })
            .await;
        self.drain_pending_transitions().await;
        true
    }

    pub async fn handle_unreserve(self: &Arc<Self>) -> bool {
        self.flash_default().await;
        true
    }

    pub async fn handle_request(self: &Arc<Self>, event: &str, json: &Value) -> Option<Value> {
        let result = {
            let guard = self.state.lock().await;
            match guard.as_ref() {
                Some(state) => state.handle_request(&self.ctx, event, json).await,
                None => None,
            }
        };
        self.drain_pending_transitions().await;
        result
    }

    pub async fn handle_exit(self: &Arc<Self>) {
        let guard = self.state.lock().await;
        if let Some(state) = guard.as_ref() {
            state.handle_exit(&self.ctx).await;
        }
    }
}
