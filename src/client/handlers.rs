//! Event handler registry, grounded on
//! `examples/original_source/src/usbipice/client/lib/BaseClient.py`'s
//! `SerialRemover` and `client/utils/DefaultEventHandler.py`. The original
//! registers handler methods per-event via an `AbstractEventHandler`
//! subclass and a `@register(event, *fields)` decorator; this crate's
//! equivalent is the static `register(event, handler)` pairing spec.md §9
//! calls out for the worker's reservable registry, applied the same way
//! here since Rust has no decorator-time side effects.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::client::api::BaseApi;
use crate::device_adapter::DeviceAdapter;

/// One incoming `{serial, event, contents}` notification, dispatched to
/// every handler registered for `event`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, serial: &str, contents: &Value);
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<(String, Arc<dyn EventHandler>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.push((event.into(), handler));
    }

    /// Dispatches to every handler registered for `event`, in registration
    /// order - mirrors `SocketEventServer.handleEvent` calling each
    /// `AbstractEventHandler` starting at index 0.
    pub async fn dispatch(&self, serial: &str, event: &str, contents: &Value) {
        for (registered_event, handler) in &self.handlers {
            if registered_event == event {
                handler.handle(serial, contents).await;
            }
        }
    }
}

/// Removes a serial from the client's tracked connections on `reservation
/// end`/`failure`. Registered first by every client, ahead of any
/// caller-supplied handler, matching `BaseClient.__init__`.
pub struct SerialRemover {
    api: Arc<BaseApi>,
}

impl SerialRemover {
    pub fn new(api: Arc<BaseApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl EventHandler for SerialRemover {
    async fn handle(&self, serial: &str, _contents: &Value) {
        self.api.remove_serial(serial);
    }
}

/// Re-extends a reservation when `reservation ending soon` fires, grounded
/// on `DefaultEventHandler.handleReservationEndingSoon`.
pub struct ReservationExtender {
    api: Arc<BaseApi>,
}

impl ReservationExtender {
    pub fn new(api: Arc<BaseApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl EventHandler for ReservationExtender {
    async fn handle(&self, serial: &str, _contents: &Value) {
        match self.api.extend(std::slice::from_ref(&serial.to_string())).await {
            Some(extended) if !extended.is_empty() => info!(serial, "refreshed reservation"),
            _ => error!(serial, "failed to refresh reservation"),
        }
    }
}

/// Logs `reservation end` notifications, grounded on
/// `DefaultEventHandler.handleReservationEnd`.
pub struct DefaultLogger;

#[async_trait]
impl EventHandler for DefaultLogger {
    async fn handle(&self, serial: &str, _contents: &Value) {
        info!(serial, "reservation for device ended");
    }
}

/// Logs `failure` notifications, grounded on
/// `DefaultEventHandler.handleFailure`.
pub struct FailureLogger;

#[async_trait]
impl EventHandler for FailureLogger {
    async fn handle(&self, serial: &str, _contents: &Value) {
        error!(serial, "device failed");
    }
}

/// Attaches the USB-over-IP endpoint locally on `export`, grounded on
/// `client/drivers/usbip/UsbipHandler.py::export` (`usbip_attach(server_ip,
/// busid, tcp_port=usbip_port)`, logged on both outcomes).
pub struct UsbipAttacher {
    adapter: Arc<dyn DeviceAdapter>,
}

impl UsbipAttacher {
    pub fn new(adapter: Arc<dyn DeviceAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl EventHandler for UsbipAttacher {
    async fn handle(&self, serial: &str, contents: &Value) {
        let busid = contents.get("busid").and_then(Value::as_str).unwrap_or("?");
        let server_ip = contents.get("server_ip").and_then(Value::as_str).unwrap_or("?");
        let usbip_port = contents.get("usbip_port").and_then(Value::as_u64).unwrap_or(0) as u16;

        if self.adapter.attach(server_ip, busid, usbip_port).await {
            info!(serial, busid, server_ip, usbip_port, "attached device over usbip");
        } else {
            error!(serial, busid, server_ip, usbip_port, "failed to attach device over usbip");
        }
    }
}

pub struct UsbipDisconnectLogger;

#[async_trait]
impl EventHandler for UsbipDisconnectLogger {
    async fn handle(&self, serial: &str, _contents: &Value) {
        warn!(serial, "usbip export disconnected");
    }
}
