//! Shared error taxonomy.
//!
//! Mirrors the error handling design in spec.md §7: transient transport
//! failures are logged and retried by whichever scheduler loop owns them
//! (they never reach these types), while the errors here represent the
//! remaining categories - malformed input, protocol violations, and
//! resource-not-found - that need to cross an API boundary as a typed value.

use std::fmt;

/// Errors a `Store` implementation can report.
///
/// Resource-not-found conditions are represented by `Ok(None)` /
/// `Ok(vec![])` at the call site per spec.md §7 ("return a negative
/// boolean/404-equivalent; do not create"); this enum only covers failures
/// of the store itself.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("unknown worker {0}")]
    UnknownWorker(String),
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("device {0} already has an active reservation")]
    AlreadyReserved(String),
    #[error("device {0} is not currently reserved")]
    NotReserved(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Errors decoding a JSON wire envelope (HTTP body or socket message).
#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("field {field} had unexpected type, expected {expected}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },
}

/// Errors from the device-adapter / firmware-IO boundary (spec.md §6 Device
/// adapter interface, §1 "out of scope" firmware-flashing primitives).
#[derive(thiserror::Error, Debug)]
pub enum DeviceAdapterError {
    #[error("failed to parse busid from devpath {0:?}")]
    BadBusid(String),
    #[error("bind failed for busid {0}")]
    BindFailed(String),
    #[error("unbind failed for busid {0}")]
    UnbindFailed(String),
    #[error("attach failed for {ip}:{busid}")]
    AttachFailed { ip: String, busid: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("subprocess {0} exited with failure")]
    SubprocessFailed(String),
}

/// A generic "the other side did not answer" error for event routing /
/// heartbeat RPCs. Transient by construction - callers log and move on,
/// never propagate this past a scheduler-loop tick boundary (spec.md §7).
#[derive(Debug)]
pub struct TransientError(pub String);

impl fmt::Display for TransientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransientError {}

impl From<reqwest::Error> for TransientError {
    fn from(value: reqwest::Error) -> Self {
        Self(value.to_string())
    }
}
