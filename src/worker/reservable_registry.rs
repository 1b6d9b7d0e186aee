//! The reservable registry, grounded on
//! `examples/original_source/src/usbipice/worker/device/state/reservable/utils.py`'s
//! `reservable`/`get_reservation_state_fac` decorator pair. The original
//! populates a dict at class-definition time; since Rust has no
//! decorator-time side effects, this is the static `register(event,
//! handler)` replacement spec.md §9 calls out.

use serde_json::Value;

use super::state::pulse_count::{PulseCountState, PulseCountStateFlasher};
use super::state::usbip::UsbipState;
use super::state::DeviceState;

/// Kinds a client may name in a `reserve` call. `pulsecount-active` is
/// deliberately excluded: it is an internal follow-on state reached only
/// via `PulseCountStateFlasher`, never directly reservable.
pub fn exists(kind: &str) -> bool {
    matches!(kind, "usbip" | "pulsecount")
}

pub fn build(kind: &str, args: Value) -> Option<Box<dyn DeviceState>> {
    match kind {
        "usbip" => Some(Box::new(UsbipState::new(args))),
        "pulsecount" => Some(Box::new(PulseCountStateFlasher::new(args))),
        "pulsecount-active" => Some(Box::new(PulseCountState::new(args))),
        _ => None,
    }
}
