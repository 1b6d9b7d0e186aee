//! Worker daemon entrypoint, grounded on
//! `original_source/src/usbipice/worker/app.py`'s startup: register this
//! worker with control, build the device manager, start the scan loop and
//! serve the HTTP/WebSocket router.

use std::sync::Arc;
use std::time::Duration;

use usbipice::config::WorkerConfig;
use usbipice::device_adapter::linux::{FsFirmwareIo, LinuxDeviceAdapter};
use usbipice::device_adapter::{DeviceAdapter, FirmwareIo};
use usbipice::event_router::EventRouter;
use usbipice::logging;
use usbipice::store::memory::MemoryStore;
use usbipice::store::Store;
use usbipice::worker::server::{router, WorkerServerState};
use usbipice::worker::DeviceManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let config = WorkerConfig::parse();
    logging::init("worker", config.verbose, Some((config.control_server.clone(), config.resolved_worker_name())))?;

    let worker_name = config.resolved_worker_name();
    let virtual_ip = config.resolved_virtual_ip();

    // A standalone worker has no control-shared store, so it keeps its own
    // in-memory registry and registers itself into it directly. A worker
    // running against a real relational `Store` (spec.md §1, out of scope
    // here) would instead call into control's registration endpoint.
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store.add_worker(&worker_name, &virtual_ip, config.server_port).await?;

    let event_router = EventRouter::new(store.clone(), Duration::from_secs(config.session_grace_seconds));

    let adapter: Arc<dyn DeviceAdapter> = Arc::new(LinuxDeviceAdapter);
    let firmware_io: Arc<dyn FirmwareIo> = Arc::new(FsFirmwareIo);

    let manager = DeviceManager::new(Arc::new(config.clone()), adapter, firmware_io, store, event_router.clone());
    let _scan_loop = manager.spawn_scan_loop();

    let app = router(WorkerServerState { manager, event_router });

    let addr = format!("0.0.0.0:{}", config.server_port);
    tracing::info!(addr, worker_name, virtual_ip, "worker listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
