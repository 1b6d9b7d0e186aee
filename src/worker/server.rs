//! Worker HTTP/WebSocket surface, grounded on
//! `examples/original_source/src/usbipice/worker/app.py`'s `create_app`
//! (the "latest" socket-based variant spec.md §9 calls out as canonical).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::event_router::EventRouter;
use crate::wire::{SocketAuth, SocketRequest, WorkerReserveRequest, WorkerUnreserveRequest};
use crate::worker::DeviceManager;

#[derive(Clone)]
pub struct WorkerServerState {
    pub manager: Arc<DeviceManager>,
    pub event_router: Arc<EventRouter>,
}

pub fn router(state: WorkerServerState) -> Router {
    Router::new()
        .route("/heartbeat", get(heartbeat))
        .route("/reserve", post(reserve))
        .route("/unreserve", post(unreserve))
        .route("/socket", get(socket_upgrade))
        .with_state(state)
}

async fn heartbeat() -> impl IntoResponse {
    axum::http::StatusCode::OK
}

async fn reserve(State(state): State<WorkerServerState>, Json(body): Json<WorkerReserveRequest>) -> impl IntoResponse {
    let ok = state.manager.reserve(&body.serial, &body.kind, body.args).await;
    if ok {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::BAD_REQUEST
    }
}

async fn unreserve(State(state): State<WorkerServerState>, Json(body): Json<WorkerUnreserveRequest>) -> impl IntoResponse {
    let ok = state.manager.unreserve(&body.serial).await;
    if ok {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::BAD_REQUEST
    }
}

async fn socket_upgrade(ws: WebSocketUpgrade, State(state): State<WorkerServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WorkerServerState) {
    let (mut sink, mut stream) = socket.split();

    let Some(Ok(Message::Text(first))) = stream.next().await else {
        warn!("socket connection closed before auth");
        return;
    };

    let Ok(auth) = serde_json::from_str::<SocketAuth>(&first) else {
        warn!("socket connection without client id");
        return;
    };
    let client_id = auth.client_id;

    debug!(client_id, "worker socket connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    state.event_router.add_socket(&client_id, tx).await;

    let forward_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&envelope) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Ok(request) = serde_json::from_str::<SocketRequest>(&text) {
                    let _ = state
                        .manager
                        .handle_request(&request.serial, &request.event, &request.contents)
                        .await;
                } else {
                    error!(client_id, "failed to load json string from client");
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    forward_task.abort();
    state.event_router.remove_socket(&client_id).await;
    debug!(client_id, "worker socket disconnected");
}
