//! Client-facing error kinds for the broker. Every operation that can fail in a way a
//! WebSocket client needs to hear about returns `BrokerError`; anything else (internal
//! state, backtraces) stays in the `tracing::error!` call site and never reaches the wire.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    #[error("failed to start session: {0}")]
    SpawnFailed(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("write to terminal timed out")]
    WriteTimeout,

    #[error("outbound queue overflow")]
    Overflow,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error")]
    InternalError,
}

impl BrokerError {
    /// The stable string sent in the wire `error` field. Deliberately coarser than
    /// `Display` for `InternalError`-adjacent cases: never exposes internal state.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            BrokerError::SpawnFailed(_) => "SpawnFailed",
            BrokerError::NotFound(_) => "NotFound",
            BrokerError::PermissionDenied(_) => "PermissionDenied",
            BrokerError::WriteTimeout => "WriteTimeout",
            BrokerError::Overflow => "Overflow",
            BrokerError::InvalidRequest(_) => "InvalidRequest",
            BrokerError::InternalError => "InternalError",
        }
    }

    /// Message shown to the client: broad terms only, per the error handling design.
    pub fn wire_message(&self) -> String {
        match self {
            BrokerError::InternalError => "an internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}
