//! JSON wire types (spec.md §6). HTTP bodies for control/worker, and the
//! socket-channel `event`/`request` envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---- Control HTTP --------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ReserveRequest {
    pub amount: u32,
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtendRequest {
    pub name: String,
    pub serials: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtendAllRequest {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndRequest {
    pub name: String,
    pub serials: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndAllRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine(pub i32, pub String);

#[derive(Debug, Clone, Deserialize)]
pub struct LogRequest {
    pub name: String,
    pub logs: Vec<LogLine>,
}

// ---- Worker HTTP ----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerReserveRequest {
    pub serial: String,
    pub kind: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerUnreserveRequest {
    pub serial: String,
}

// ---- Socket channel (spec.md §6 Socket channel) ---------------------------

/// Connect-time auth payload: `{client_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketAuth {
    pub client_id: String,
}

/// Server → client: `{serial, contents: {event, ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketEvent {
    pub serial: String,
    pub contents: Value,
}

/// Client → server: `{serial, event, contents, client_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketRequest {
    pub serial: String,
    pub event: String,
    pub contents: Value,
    pub client_id: String,
}
