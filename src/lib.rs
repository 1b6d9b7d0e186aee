//! usbipice: a distributed reservation fabric for USB-attached
//! microcontroller boards. Three daemons share this crate: `control`
//! (reservation/heartbeat bookkeeping), `worker` (hosts physical devices),
//! and `client` (reserves and uses them). See `DESIGN.md` for how each
//! module is grounded.

pub mod client;
pub mod config;
pub mod control;
pub mod device_adapter;
pub mod error;
pub mod event_router;
pub mod logging;
pub mod model;
pub mod store;
pub mod wire;
pub mod worker;
