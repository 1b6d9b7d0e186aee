//! The per-device state machine (spec.md §4.1): a sum type with a dispatch
//! table, grounded on `AbstractState`/`Device.switch`
//! (examples/original_source/src/usbipice/worker/device/state/core/AbstractState.py,
//! `Device.py`). Rust has no convenient reentrant async mutex, so `switch`
//! is restructured into the deferred-work-queue alternative spec.md §9
//! names: a state requests a transition by stashing a `Transition` on the
//! `DeviceContext`; the owning `Device` performs the actual swap after the
//! handler that requested it returns.

pub mod broken;
pub mod flash;
pub mod pulse_count;
pub mod ready;
pub mod test;
pub mod usbip;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::model::DeviceProperties;
use crate::worker::device::DeviceContext;
use crate::worker::reservable_registry;

/// Common protocol every device state implements
/// (`start/handleAdd/handleRemove/handleRequest/handleExit`).
#[async_trait]
pub trait DeviceState: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once after construction, for actions that may themselves
    /// request a switch (e.g. replaying known device nodes).
    async fn start(&self, _ctx: &Arc<DeviceContext>) {}

    async fn handle_add(&self, _ctx: &Arc<DeviceContext>, _dev: &DeviceProperties) {}

    async fn handle_remove(&self, _ctx: &Arc<DeviceContext>, _dev: &DeviceProperties) {}

    /// Dispatches a client-socket request registered under `event`,
    /// projecting `json` into whatever arguments that handler expects.
    async fn handle_request(&self, _ctx: &Arc<DeviceContext>, _event: &str, _json: &Value) -> Option<Value> {
        None
    }

    /// Releases resources held by this state. Must complete before the
    /// incoming state's `start()` runs (spec.md §8 State-machine safety).
    async fn handle_exit(&self, _ctx: &Arc<DeviceContext>) {}
}

/// What to construct next. A plain enum rather than a boxed factory
/// closure: the set of reachable states is fixed, matching spec.md's
/// "use a sum type with a dispatch table" guidance (§9).
#[derive(Debug, Clone)]
pub enum Transition {
    Flash {
        firmware_path: PathBuf,
        next: Box<Transition>,
        timeout: Option<Duration>,
    },
    Test,
    Ready,
    Broken,
    Reservable {
        kind: String,
        args: Value,
    },
}

pub fn build_state(transition: Transition) -> Box<dyn DeviceState> {
    match transition {
        Transition::Flash { firmware_path, next, timeout } => {
            Box::new(flash::FlashState::new(firmware_path, *next, timeout))
        }
        Transition::Test => Box::new(test::TestState::new()),
        Transition::Ready => Box::new(ready::ReadyState::new()),
        Transition::Broken => Box::new(broken::BrokenState::new()),
        Transition::Reservable { kind, args } => {
            reservable_registry::build(&kind, args).unwrap_or_else(|| Box::new(broken::BrokenState::new()))
        }
    }
}
