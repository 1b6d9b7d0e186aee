//! `pulsecount` reservable, grounded on
//! `examples/original_source/src/usbipice/worker/device/state/reservable/PulseCountState.py`.
//! Demonstrates that the reservable registry is generic: reserving as
//! `pulsecount` first reflashes the device with the pulse-count firmware,
//! then opens its serial port and accepts bitstreams to evaluate over a
//! simple chunked framing (spec.md §9 OQ3: 512-byte chunks, 10µs
//! inter-chunk delay, 115200 baud).

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::model::DeviceProperties;
use crate::worker::device::DeviceContext;

use super::{DeviceState, Transition};

const BAUD: u32 = 115_200;
const CHUNK_SIZE: usize = 512;
const INTER_CHUNK_DELAY: Duration = Duration::from_micros(10);

/// The entry point for a `pulsecount` reservation: reflash with the
/// pulse-count firmware, then hand off to `PulseCountState`.
pub struct PulseCountStateFlasher {
    args: Value,
}

impl PulseCountStateFlasher {
    pub fn new(args: Value) -> Self {
        Self { args }
    }
}

#[async_trait]
impl DeviceState for PulseCountStateFlasher {
    fn name(&self) -> &'static str {
        "PulseCountFlasher"
    }

    async fn start(&self, ctx: &Arc<DeviceContext>) {
        let Some(firmware) = ctx.config.pulse_count_firmware.clone() else {
            error!(serial = %ctx.serial, "pulsecount reserved but no firmware configured");
            ctx.request_switch(Transition::Broken).await;
            return;
        };

        ctx.request_switch(Transition::Flash {
            firmware_path: firmware.into(),
            next: Box::new(Transition::Reservable {
                kind: "pulsecount-active".to_string(),
                args: self.args.clone(),
            }),
            timeout: Some(Duration::from_secs(60)),
        })
        .await;
    }
}

struct Bitstream {
    data: Vec<u8>,
    name: String,
}

enum ReaderEvent {
    Pulses(String),
    Timeout,
}

pub struct PulseCountState {
    queue_tx: Mutex<Option<mpsc::UnboundedSender<Bitstream>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PulseCountState {
    pub fn new(_args: Value) -> Self {
        Self {
            queue_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DeviceState for PulseCountState {
    fn name(&self) -> &'static str {
        "PulseCount"
    }

    async fn start(&self, ctx: &Arc<DeviceContext>) {
        ctx.send_event(json!({ "event": "initialized", "serial": ctx.serial })).await;

        // Let newly-enumerated tty ports settle before looking for the
        // evaluation interface.
        tokio::time::sleep(Duration::from_secs(2)).await;

        let devs = ctx.adapter.known_devices(&ctx.serial).await;
        let Some(port) = devs
            .iter()
            .find(|d| d.get("ID_USB_INTERFACE_NUM").map(String::as_str) == Some("00"))
            .and_then(|d| d.get("DEVNAME"))
            .cloned()
        else {
            warn!(serial = %ctx.serial, "no pulse-count interface found");
            ctx.request_switch(Transition::Broken).await;
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.queue_tx.lock().await = Some(tx);

        let ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            run_pulse_loop(ctx, port, rx).await;
        });
        *self.worker.lock().await = Some(handle);
    }

    async fn handle_request(&self, ctx: &Arc<DeviceContext>, event: &str, json: &Value) -> Option<Value> {
        if event != "evaluate" {
            return None;
        }

        let files = json.get("files")?.as_object()?;
        let Some(tx) = self.queue_tx.lock().await.clone() else {
            return Some(serde_json::json!(false));
        };

        let mut names = Vec::new();
        for (name, contents) in files {
            let Some(encoded) = contents.as_str() else { continue };
            let Ok(data) = base64_decode(encoded) else { continue };
            names.push(name.clone());
            let _ = tx.send(Bitstream { data, name: name.clone() });
        }

        debug!(serial = %ctx.serial, ?names, "queued bitstreams");
        Some(serde_json::json!(true))
    }

    async fn handle_exit(&self, _ctx: &Arc<DeviceContext>) {
        self.queue_tx.lock().await.take();
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
        }
    }
}

async fn run_pulse_loop(ctx: Arc<DeviceContext>, port: String, mut queue: mpsc::UnboundedReceiver<Bitstream>) {
    let mut results = serde_json::Map::new();

    while let Some(bitstream) = queue.recv().await {
        debug!(serial = %ctx.serial, name = %bitstream.name, "evaluating bitstream");

        let port = port.clone();
        let outcome = tokio::task::spawn_blocking(move || evaluate_bitstream(&port, &bitstream.data))
            .await
            .unwrap_or(Err("evaluation task panicked".to_string()));

        match outcome {
            Ok(ReaderEvent::Pulses(count)) => {
                results.insert(bitstream.name, Value::String(count));
            }
            Ok(ReaderEvent::Timeout) | Err(_) => {
                warn!(serial = %ctx.serial, name = %bitstream.name, "bitstream evaluation produced no pulse count");
            }
        }

        if queue.is_empty() && !results.is_empty() {
            ctx.send_event(json!({
                "event": "results",
                "serial": ctx.serial,
                "results": Value::Object(std::mem::take(&mut results)),
            }))
            .await;
        }
    }
}

/// Opens the serial port synchronously (the `serialport` crate is
/// blocking) and performs one chunked upload/pulse-wait cycle.
fn evaluate_bitstream(port: &str, data: &[u8]) -> Result<ReaderEvent, String> {
    let mut serial = serialport::new(port, BAUD)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| e.to_string())?;

    for chunk in data.chunks(CHUNK_SIZE) {
        serial.write_all(chunk).map_err(|e| e.to_string())?;
        std::thread::sleep(INTER_CHUNK_DELAY);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let mut buf = [0u8; 256];
    let mut accumulated = String::new();

    while std::time::Instant::now() < deadline {
        match serial.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                accumulated.push_str(&String::from_utf8_lossy(&buf[..n]));
                if let Some(captures) = find_pulses(&accumulated) {
                    return Ok(ReaderEvent::Pulses(captures));
                }
                if accumulated.contains("Watchdog timeout") {
                    return Ok(ReaderEvent::Timeout);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e.to_string()),
        }
    }

    Ok(ReaderEvent::Timeout)
}

fn find_pulses(haystack: &str) -> Option<String> {
    let marker = "pulses: ";
    let start = haystack.find(marker)? + marker.len();
    let digits: String = haystack[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Bitstream payloads arrive as base64-encoded strings inside the `files`
/// request object over the socket channel (the original accepts
/// multipart file uploads over HTTP; this transport carries JSON only).
fn base64_decode(input: &str) -> Result<Vec<u8>, ()> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.decode(input).map_err(|_| ())
}
