//! Shared server-side event fan-out, grounded on `EventSender`
//! (examples/original_source/src/usbipice/worker/EventSender.py) and its
//! `ControlEventSender` subclass. Control and worker each own one
//! `EventRouter`; it tracks one `Session` per connected client id and
//! routes `send(serial, ...)` calls to whichever client currently holds
//! that device's reservation via the `Store`.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::error;

use crate::store::Store;
use crate::wire::SocketEvent;
pub use session::{Session, SocketHandle};

pub struct EventRouter {
    store: Arc<dyn Store>,
    grace: Duration,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl EventRouter {
    pub fn new(store: Arc<dyn Store>, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            grace,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the session for `client_id`, creating it (with its grace
    /// timeout running) if this is the first time we've heard of it.
    pub async fn start_session(self: &Arc<Self>, client_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(client_id) {
            return existing.clone();
        }

        let router = self.clone();
        let session = Session::new(client_id.to_string(), self.grace, move |expired_id| {
            let router = router.clone();
            let expired_id = expired_id.to_string();
            tokio::spawn(async move {
                router.end_session(&expired_id).await;
            });
        });
        sessions.insert(client_id.to_string(), session.clone());
        session
    }

    pub async fn add_socket(self: &Arc<Self>, client_id: &str, socket: SocketHandle) {
        let session = self.start_session(client_id).await;
        session.set_socket(socket).await;
    }

    pub async fn remove_socket(self: &Arc<Self>, client_id: &str) {
        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(client_id).cloned()
        };
        match session {
            Some(session) => session.remove_socket().await,
            None => error!(client_id, "tried to remove socket for session that does not exist"),
        }
    }

    pub async fn end_session(self: &Arc<Self>, client_id: &str) {
        self.sessions.lock().await.remove(client_id);
    }

    /// Looks up `serial`'s current reservation holder via the store and
    /// routes `contents` to that client's session, buffering it if the
    /// client has no bound socket right now.
    pub async fn send(self: &Arc<Self>, serial: &str, contents: Value) {
        let client_id = match self.store.get_device_callback(serial).await {
            Ok(Some(client_id)) => client_id,
            Ok(None) => {
                error!(serial, "tried to send event but device has no reservation");
                return;
            }
            Err(err) => {
                error!(serial, %err, "failed to look up device callback");
                return;
            }
        };

        let session = self.start_session(&client_id).await;
        session.send(envelope(serial, contents)).await;
    }

    /// Sends directly to a known client id, bypassing the serial lookup.
    /// Used where the caller already knows the recipient (e.g. control
    /// replying to a reservation end it initiated).
    pub async fn send_to_client(self: &Arc<Self>, client_id: &str, serial: &str, contents: Value) {
        let session = self.start_session(client_id).await;
        session.send(envelope(serial, contents)).await;
    }
}

/// Wraps `contents` in the `{serial, contents}` wire envelope clients expect
/// on the socket, as a ready-to-send `Value` the session queue can hold
/// without the server layer having to reconstruct it later.
fn envelope(serial: &str, contents: Value) -> Value {
    serde_json::to_value(SocketEvent { serial: serial.to_string(), contents }).unwrap_or(Value::Null)
}
