//! Tracing subscriber setup, mirroring `usbvfiod::main`'s `FmtSubscriber`
//! wiring, plus a `Layer` that forwards records to control's `/log`
//! endpoint the way `original_source/utils/RemoteLogger` forwards Python
//! `logging` records.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::wire::LogLine;

pub fn verbosity_to_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Installs the global subscriber: stdout formatting plus (optionally) a
/// remote-forwarding layer. Also bridges the `log` facade the way
/// `usbvfiod::main` does with `tracing_log::LogTracer::init()`.
pub fn init(name: &str, verbose: u8, control_server: Option<(String, String)>) -> anyhow::Result<()> {
    use anyhow::Context as _;

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity_to_level(verbose).into())
        .from_env_lossy();

    let fmt_layer = fmt::layer().with_target(true).with_ansi(true);

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if let Some((control_url, process_name)) = control_server {
        let remote = RemoteLogLayer::new(control_url, process_name);
        tracing::subscriber::set_global_default(subscriber.with(remote))
            .context("failed to set global tracing subscriber")?;
    } else {
        tracing::subscriber::set_global_default(subscriber)
            .context("failed to set global tracing subscriber")?;
    }

    tracing_log::LogTracer::init().context("failed to install log-to-tracing bridge")?;

    tracing::info!(process = name, "logging initialized");
    Ok(())
}

/// Batches emitted events and flushes them to `{control_url}/log` on an
/// interval, matching `RemoteLogger`'s behavior of forwarding
/// `[name@host] msg` lines to control. Never blocks the emitting task:
/// records are pushed into a bounded in-memory batch and a background
/// task drains it.
#[derive(Debug)]
struct RemoteLogLayer {
    batch: Arc<Mutex<Vec<(i32, String)>>>,
}

impl RemoteLogLayer {
    fn new(control_url: String, process_name: String) -> Self {
        let batch = Arc::new(Mutex::new(Vec::new()));
        let flush_batch = batch.clone();

        // `init()` runs before the tokio runtime exists on some call sites
        // (e.g. under `#[tokio::main]` it is fine, but keep this resilient
        // by only spawning if a runtime handle is reachable).
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let client = reqwest::Client::new();
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                loop {
                    ticker.tick().await;
                    let lines: Vec<(i32, String)> = {
                        let mut guard = flush_batch.lock().unwrap_or_else(|e| e.into_inner());
                        std::mem::take(&mut *guard)
                    };
                    if lines.is_empty() {
                        continue;
                    }
                    let logs: Vec<LogLine> = lines.into_iter().map(|(l, m)| LogLine(l, m)).collect();
                    let body = serde_json::json!({ "name": process_name, "logs": logs });
                    let _ = client
                        .get(format!("{control_url}/log"))
                        .json(&body)
                        .timeout(Duration::from_secs(10))
                        .send()
                        .await;
                }
            });
        }

        Self { batch }
    }
}

impl<S: Subscriber> Layer<S> for RemoteLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let level = match *event.metadata().level() {
            Level::ERROR => 40,
            Level::WARN => 30,
            Level::INFO => 20,
            Level::DEBUG => 10,
            Level::TRACE => 5,
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        if let Ok(mut guard) = self.batch.lock() {
            guard.push((level, visitor.message));
            // Bound the batch so a disconnected control server cannot grow
            // this unboundedly between flushes.
            if guard.len() > 1000 {
                guard.drain(0..500);
            }
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}
