//! WebSocket dialing to control and worker sockets, grounded on
//! `examples/original_source/src/usbipice/client/lib/SocketEventServer.py`
//! (selected over the older plain-HTTP `EventServer.py` the same way
//! workers prefer the socket-based `app.py` over `server.py`).

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

use crate::client::handlers::HandlerRegistry;
use crate::wire::SocketAuth;

type WsSender = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// One dialed socket (control, or a worker hosting a reserved device): the
/// write half plus the reader task's handle, so the connection can be torn
/// down cleanly.
struct DialedSocket {
    sink: Mutex<WsSender>,
    reader: tokio::task::JoinHandle<()>,
}

pub struct SocketEventServer {
    client_id: String,
    handlers: Arc<HandlerRegistry>,
    control: Mutex<Option<Arc<DialedSocket>>>,
    workers: Mutex<HashMap<String, Arc<DialedSocket>>>,
}

fn ws_url(http_url: &str) -> String {
    format!("{}/socket", http_url.replacen("http://", "ws://", 1).replacen("https://", "wss://", 1))
}

impl SocketEventServer {
    pub fn new(client_id: String, handlers: Arc<HandlerRegistry>) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            handlers,
            control: Mutex::new(None),
            workers: Mutex::new(HashMap::new()),
        })
    }

    async fn dial(self: &Arc<Self>, url: &str) -> Option<Arc<DialedSocket>> {
        let (stream, _) = match tokio_tungstenite::connect_async(ws_url(url)).await {
            Ok(pair) => pair,
            Err(err) => {
                error!(url, %err, "connection attempt failed");
                return None;
            }
        };

        let (mut sink, mut stream) = stream.split();

        let auth = serde_json::to_string(&SocketAuth { client_id: self.client_id.clone() }).ok()?;
        if sink.send(Message::Text(auth.into())).await.is_err() {
            return None;
        }

        debug!(url, "connected");

        let server = self.clone();
        let url_owned = url.to_string();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => server.handle_frame(&text).await,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            warn!(url = %url_owned, "disconnected");
        });

        Some(Arc::new(DialedSocket { sink: Mutex::new(sink), reader }))
    }

    async fn handle_frame(&self, text: &str) {
        let Ok(envelope) = serde_json::from_str::<Value>(text) else {
            error!("received unparsable data");
            return;
        };

        let Some(serial) = envelope.get("serial").and_then(Value::as_str) else {
            error!("bad event contents");
            return;
        };
        let Some(contents) = envelope.get("contents") else {
            error!("bad event contents");
            return;
        };
        let Some(event) = contents.get("event").and_then(Value::as_str) else {
            error!("bad event contents");
            return;
        };

        debug!(serial, event, "received event");
        self.handlers.dispatch(serial, event, contents).await;
    }

    pub async fn connect_control(self: &Arc<Self>, url: &str) {
        let socket = self.dial(url).await;
        *self.control.lock().await = socket;
    }

    pub async fn connect_worker(self: &Arc<Self>, url: &str) {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(url) {
            return;
        }
        drop(workers);

        let Some(socket) = self.dial(url).await else {
            return;
        };
        workers = self.workers.lock().await;
        workers.insert(url.to_string(), socket);
    }

    pub async fn disconnect_worker(&self, url: &str) {
        let socket = self.workers.lock().await.remove(url);
        if let Some(socket) = socket {
            socket.reader.abort();
        }
    }

    /// Sends `contents` to the worker dialed at `url` as a `SocketRequest`,
    /// adding `client_id` per `SocketEventServer.sendWorker`.
    pub async fn send_worker(&self, url: &str, serial: &str, event: &str, contents: Value) -> bool {
        let workers = self.workers.lock().await;
        let Some(socket) = workers.get(url).cloned() else {
            return false;
        };
        drop(workers);

        let body = json!({
            "serial": serial,
            "event": event,
            "contents": contents,
            "client_id": self.client_id,
        });
        let Ok(text) = serde_json::to_string(&body) else {
            return false;
        };

        socket.sink.lock().await.send(Message::Text(text.into())).await.is_ok()
    }

    pub async fn exit(&self) {
        if let Some(socket) = self.control.lock().await.take() {
            socket.reader.abort();
        }
        let urls: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        for url in urls {
            self.disconnect_worker(&url).await;
        }
    }
}
