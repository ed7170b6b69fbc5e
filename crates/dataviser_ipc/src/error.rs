use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What went wrong on the host side of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostFailureKind {
    /// Reading or listing something on disk failed.
    Io,
    /// The request could not be decoded into a known action.
    InvalidRequest,
    /// The host does not implement the action.
    Unsupported,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct HostFailure {
    pub kind: HostFailureKind,
    pub message: String,
}

impl HostFailure {
    pub fn new(kind: HostFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(HostFailureKind::Io, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(HostFailureKind::InvalidRequest, message)
    }
}

/// Errors surfaced to callers of the correlation channel and the bridge client.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No reply arrived within the bounded wait.
    #[error("`{action}` got no reply after {ms} ms")]
    Timeout { action: String, ms: u64 },

    /// The channel's listener is gone; nothing can be resolved any more.
    #[error("correlation channel is closed")]
    Closed,

    /// The user dismissed a dialog without choosing anything.
    #[error("cancelled by user")]
    Cancelled,

    #[error("host I/O failure: {0}")]
    Io(String),

    #[error("host rejected `{action}`: {failure}")]
    Host { action: String, failure: HostFailure },

    /// The reply did not have the shape the action promises.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Map a host failure into the error taxonomy, keeping I/O distinct.
    pub fn from_failure(action: &str, failure: HostFailure) -> Self {
        match failure.kind {
            HostFailureKind::Io => BridgeError::Io(failure.message),
            _ => BridgeError::Host {
                action: action.to_string(),
                failure,
            },
        }
    }
}
