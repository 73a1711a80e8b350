//! Error taxonomy shared by the client, watch and command layers.

use thiserror::Error;

pub type KubeResult<T> = Result<T, KubeError>;

/// Errors surfaced by the Kubernetes transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KubeError {
    /// Network-level failure (connect, TLS, broken pipe).
    #[error("transport: {0}")]
    Transport(String),
    /// Non-2xx response from the API server.
    #[error("api error {status} ({reason}): {message}")]
    Api { status: u16, reason: String, message: String },
    /// The server ended a watch connection.
    #[error("watch stream closed by server")]
    StreamClosed,
    /// History was compacted past the requested resource version (HTTP 410).
    #[error("resource version too old: {0}")]
    StaleResourceVersion(String),
    /// Credentials rejected or missing.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Object could not be decoded into a snapshot.
    #[error("decode: {0}")]
    Decode(String),
}

impl KubeError {
    pub fn api(status: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        KubeError::Api { status, reason: reason.into(), message: message.into() }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            KubeError::Api { status, .. } => Some(*status),
            KubeError::StaleResourceVersion(_) => Some(410),
            KubeError::Unauthorized(_) => Some(401),
            _ => None,
        }
    }

    /// Worth another attempt after a backoff: network failures, throttling and 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            KubeError::Transport(_) | KubeError::StreamClosed => true,
            KubeError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Persistent configuration problems that retrying cannot fix.
    pub fn is_terminal(&self) -> bool {
        match self {
            KubeError::Unauthorized(_) => true,
            KubeError::Api { status, .. } => matches!(*status, 401 | 403 | 404),
            _ => false,
        }
    }
}
