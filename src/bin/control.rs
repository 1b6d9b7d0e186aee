//! Control daemon entrypoint, grounded on `original_source/src/usbipice/control/app.py`'s
//! `if __name__ == "__main__"` wiring: build the store, the event router,
//! the reservation service, start the four heartbeat loops and serve the
//! HTTP/WebSocket router.

use std::sync::Arc;
use std::time::Duration;

use usbipice::config::ControlConfig;
use usbipice::control::heartbeat::{HeartbeatConfig, HeartbeatScheduler};
use usbipice::control::reservation::{ReservationService, ReservationTimings};
use usbipice::control::server::{router, ControlServerState};
use usbipice::event_router::EventRouter;
use usbipice::logging;
use usbipice::store::memory::MemoryStore;
use usbipice::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let config = ControlConfig::parse();
    logging::init("control", config.verbose, None)?;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let event_router = EventRouter::new(store.clone(), Duration::from_secs(config.session_grace_seconds));

    let reservations = Arc::new(ReservationService::new(
        store.clone(),
        event_router.clone(),
        ReservationTimings {
            reserve_for: Duration::from_secs(config.reserve_seconds.max(0) as u64),
            extend_by: Duration::from_secs(config.extend_seconds.max(0) as u64),
        },
    ));

    let heartbeat = HeartbeatScheduler::new(
        store.clone(),
        event_router.clone(),
        HeartbeatConfig {
            heartbeat_poll: Duration::from_secs(config.heartbeat_poll_seconds),
            timeout_poll: Duration::from_secs(config.timeout_poll_seconds),
            timeout_duration: Duration::from_secs(config.timeout_duration_seconds),
            reservation_poll: Duration::from_secs(config.reservation_poll_seconds),
            reservation_expiring_poll: Duration::from_secs(config.reservation_expiring_poll_seconds),
            reservation_notify_at: Duration::from_secs((config.reservation_notify_at_minutes.max(0) as u64) * 60),
        },
    );
    let _loops = heartbeat.spawn_all();

    let app = router(ControlServerState { reservations, event_router });

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(addr, "control listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
