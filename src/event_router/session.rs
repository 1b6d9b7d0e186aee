//! Per-client session buffering, grounded on `EventSender.Session`
//! (examples/original_source/src/usbipice/worker/EventSender.py): a FIFO
//! queue of not-yet-delivered events, a single bound socket, and a grace
//! timeout that ends the session if no socket binds in time.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A bound client socket's outbound half. The websocket handler owns the
/// other end and forwards anything sent here onto the wire.
pub type SocketHandle = mpsc::UnboundedSender<Value>;

struct Inner {
    socket: Option<SocketHandle>,
    queue: Vec<Value>,
    timeout: Option<JoinHandle<()>>,
}

/// One client's event delivery state. Survives across reconnects: events
/// sent while no socket is bound buffer here and flush once one binds.
pub struct Session {
    client_id: String,
    grace: Duration,
    inner: Mutex<Inner>,
    on_timeout: Box<dyn Fn(&str) + Send + Sync>,
}

impl Session {
    pub fn new(client_id: String, grace: Duration, on_timeout: impl Fn(&str) + Send + Sync + 'static) -> Arc<Self> {
        let session = Arc::new(Self {
            client_id,
            grace,
            inner: Mutex::new(Inner {
                socket: None,
                queue: Vec::new(),
                timeout: None,
            }),
            on_timeout: Box::new(on_timeout),
        });
        Session::start_timeout(&session);
        session
    }

    fn start_timeout(self: &Arc<Self>) {
        let session = self.clone();
        let grace = self.grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            error!(client_id = %session.client_id, "client did not connect in time");
            (session.on_timeout)(&session.client_id);
        });

        // Fire-and-forget: replacing `inner.timeout` happens synchronously
        // from callers holding the lock, so this is only raced against
        // itself, never against `stop_timeout`.
        if let Ok(mut guard) = self.inner.try_lock() {
            guard.timeout = Some(handle);
        }
    }

    async fn stop_timeout(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(handle) = guard.timeout.take() {
            handle.abort();
        }
    }

    /// Binds a live socket, stops the grace timeout, and flushes anything
    /// queued while disconnected.
    pub async fn set_socket(self: &Arc<Self>, socket: SocketHandle) {
        {
            let mut guard = self.inner.lock().await;
            guard.socket = Some(socket);
        }
        info!(client_id = %self.client_id, "socket connected");
        self.stop_timeout().await;
        self.flush().await;
    }

    /// Unbinds the socket and restarts the grace timeout.
    pub async fn remove_socket(self: &Arc<Self>) {
        {
            let mut guard = self.inner.lock().await;
            guard.socket = None;
        }
        info!(client_id = %self.client_id, "socket disconnected");
        Session::start_timeout(self);
    }

    /// Queues `data` and attempts an immediate flush.
    pub async fn send(self: &Arc<Self>, data: Value) {
        {
            let mut guard = self.inner.lock().await;
            guard.queue.push(data);
        }
        self.flush().await;
    }

    async fn flush(self: &Arc<Self>) {
        let (messages, socket) = {
            let mut guard = self.inner.lock().await;
            if guard.queue.is_empty() {
                return;
            }
            let Some(socket) = guard.socket.clone() else {
                warn!(client_id = %self.client_id, "no socket to flush to");
                return;
            };
            (std::mem::take(&mut guard.queue), socket)
        };

        let mut undelivered = Vec::new();
        for message in messages {
            if socket.send(message.clone()).is_err() {
                undelivered.push(message);
            }
        }

        if !undelivered.is_empty() {
            warn!(client_id = %self.client_id, "socket disconnected during flush");
            let mut guard = self.inner.lock().await;
            undelivered.extend(std::mem::take(&mut guard.queue));
            guard.queue = undelivered;
            guard.socket = None;
            return;
        }

        debug!(client_id = %self.client_id, "flushed events");
    }
}
