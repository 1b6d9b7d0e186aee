//! The control daemon: reservation bookkeeping, periodic heartbeat/timeout
//! sweeps, and the HTTP/WebSocket surface clients and workers talk to.
//! Grounded on `examples/original_source/src/usbipice/control/**`.

pub mod heartbeat;
pub mod reservation;
pub mod server;
