//! Control HTTP + WebSocket surface, grounded on `app.py::create_app` (the
//! socket-based variant spec.md §9 calls out as canonical over the legacy
//! `server.py`).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::control::reservation::ReservationService;
use crate::event_router::EventRouter;
use crate::wire::{EndAllRequest, EndRequest, ExtendAllRequest, ExtendRequest, LogRequest, ReserveRequest, SocketAuth};

#[derive(Clone)]
pub struct ControlServerState {
    pub reservations: Arc<ReservationService>,
    pub event_router: Arc<EventRouter>,
}

pub fn router(state: ControlServerState) -> Router {
    Router::new()
        .route("/reserve", post(reserve))
        .route("/extend", post(extend))
        .route("/extendall", post(extend_all))
        .route("/end", post(end))
        .route("/endall", post(end_all))
        .route("/log", post(log))
        .route("/socket", get(socket_upgrade))
        .with_state(state)
}

async fn reserve(State(state): State<ControlServerState>, Json(body): Json<ReserveRequest>) -> impl IntoResponse {
    match state.reservations.reserve(&body.name, body.amount, &body.kind, body.args).await {
        Ok(reserved) => Json(reserved).into_response(),
        Err(err) => {
            warn!(%err, "reserve failed");
            axum::http::StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn extend(State(state): State<ControlServerState>, Json(body): Json<ExtendRequest>) -> impl IntoResponse {
    match state.reservations.extend(&body.name, &body.serials).await {
        Ok(serials) => Json(serials).into_response(),
        Err(err) => {
            warn!(%err, "extend failed");
            axum::http::StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn extend_all(State(state): State<ControlServerState>, Json(body): Json<ExtendAllRequest>) -> impl IntoResponse {
    match state.reservations.extend_all(&body.name).await {
        Ok(serials) => Json(serials).into_response(),
        Err(err) => {
            warn!(%err, "extend_all failed");
            axum::http::StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn end(State(state): State<ControlServerState>, Json(body): Json<EndRequest>) -> impl IntoResponse {
    match state.reservations.end(&body.name, &body.serials).await {
        Ok(serials) => Json(serials).into_response(),
        Err(err) => {
            warn!(%err, "end failed");
            axum::http::StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn end_all(State(state): State<ControlServerState>, Json(body): Json<EndAllRequest>) -> impl IntoResponse {
    match state.reservations.end_all(&body.name).await {
        Ok(serials) => Json(serials).into_response(),
        Err(err) => {
            warn!(%err, "end_all failed");
            axum::http::StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn log(Json(body): Json<LogRequest>) -> impl IntoResponse {
    for line in body.logs {
        tracing::info!(client = %body.name, level = line.0, "{}", line.1);
    }
    axum::http::StatusCode::OK
}

async fn socket_upgrade(ws: WebSocketUpgrade, State(state): State<ControlServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ControlServerState) {
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

    debug!(client_id, "control socket connected");

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
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Text(_)) => {
                // Control never accepts client-initiated device requests;
                // only workers do. Anything the client sends here besides
                // auth is ignored, mirroring `app.py`'s socket handler,
                // which registers no `@socketio.on` beyond connect/disconnect.
            }
            _ => {}
        }
    }

    forward_task.abort();
    state.event_router.remove_socket(&client_id).await;
    debug!(client_id, "control socket disconnected");
}
