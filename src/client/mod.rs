//! The client library: `BaseApi`/`BaseClient`-equivalent reservation
//! tracking, socket dialing, event handler dispatch, connection-timeout
//! detection, and bulk firmware flashing. Grounded on
//! `examples/original_source/src/usbipice/client/**`.

pub mod api;
pub mod event_server;
pub mod firmware_flasher;
pub mod handlers;
pub mod timeout_detector;

use std::sync::Arc;

use serde_json::Value;

use api::BaseApi;
use event_server::SocketEventServer;
use handlers::{DefaultLogger, EventHandler, FailureLogger, HandlerRegistry, SerialRemover, UsbipAttacher, UsbipDisconnectLogger};

use crate::device_adapter::DeviceAdapter;

/// `BaseClient`-equivalent: owns the reservation-tracking `BaseApi`, the
/// dialed-socket `SocketEventServer`, and the handler registry every event
/// gets dispatched through. Grounded on `client/lib/BaseClient.py`.
pub struct Client {
    api: Arc<BaseApi>,
    event_server: Arc<SocketEventServer>,
}

impl Client {
    /// Builds the client with the built-in handlers (`SerialRemover` first,
    /// matching `BaseClient.__init__`, plus the `usbip` reservable's
    /// `BaseUsbipEventHandler` pair) plus any caller-supplied ones, then
    /// dials the control socket.
    pub async fn new(
        control_url: String,
        client_name: String,
        adapter: Arc<dyn DeviceAdapter>,
        extra_handlers: Vec<(&'static str, Arc<dyn EventHandler>)>,
    ) -> Self {
        let api = Arc::new(BaseApi::new(control_url.clone(), client_name.clone()));

        let mut registry = HandlerRegistry::new();
        registry.register("reservation end", Arc::new(SerialRemover::new(api.clone())));
        registry.register("failure", Arc::new(SerialRemover::new(api.clone())));
        registry.register("reservation end", Arc::new(DefaultLogger));
        registry.register("failure", Arc::new(FailureLogger));
        registry.register("export", Arc::new(UsbipAttacher::new(adapter)));
        registry.register("disconnect", Arc::new(UsbipDisconnectLogger));
        for (event, handler) in extra_handlers {
            registry.register(event, handler);
        }

        let event_server = SocketEventServer::new(client_name, Arc::new(registry));
        event_server.connect_control(&control_url).await;

        Self { api, event_server }
    }

    pub fn api(&self) -> &Arc<BaseApi> {
        &self.api
    }

    pub fn event_server(&self) -> &Arc<SocketEventServer> {
        &self.event_server
    }

    /// Reserves `amount` devices of `kind`, then dials each returned
    /// serial's worker socket (mirrors `BaseClient.reserve`).
    pub async fn reserve(&self, amount: u32, kind: &str, args: Value) -> Option<Vec<String>> {
        let serials = self.api.reserve(amount, kind, args).await?;

        let mut connected = Vec::with_capacity(serials.len());
        for serial in &serials {
            let Some(info) = self.api.connection_info(serial) else {
                tracing::error!(serial, "could not get connection info for reserved serial");
                continue;
            };
            self.event_server.connect_worker(&info.url()).await;
            connected.push(serial.clone());
        }
        Some(connected)
    }

    /// Removes `serial` from tracking and, if no other reservation still
    /// uses that worker connection, disconnects its socket.
    pub async fn remove_serial(&self, serial: &str) {
        let info = self.api.connection_info(serial);
        self.api.remove_serial(serial);

        if let Some(info) = info {
            if !self.api.using_connection(&info) {
                self.event_server.disconnect_worker(&info.url()).await;
            }
        }
    }

    /// Sends `contents` to the worker hosting `serial` as a socket
    /// `request`, mirroring `BaseClient.requestWorker`.
    pub async fn request_worker(&self, serial: &str, event: &str, contents: Value) -> bool {
        let Some(info) = self.api.connection_info(serial) else {
            return false;
        };
        self.event_server.send_worker(&info.url(), serial, event, contents).await
    }

    pub async fn stop(&self) {
        self.event_server.exit().await;
        self.api.end_all().await;
    }
}

pub use api::ConnectionInfo as WorkerConnection;
