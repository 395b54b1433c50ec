use thiserror::Error;

use super::RequestId;

/// Errors surfaced by the TraceWire protocol, transport and correlation layers.
///
/// The variants fall into four groups:
///
/// - **Correlation timeouts** (`Timeout`): a synchronous invocation's deadline
///   elapsed with no response.
/// - **Lost connections** (`ConnectionLost`, `NotConnected`): the transport closed
///   before a pending invocation or handshake resolved.
/// - **Contract violations** (`StateViolation`, `UnknownOperation`): a caller broke
///   an invariant. These are never retried.
/// - **Transport and codec failures** (everything else).
#[derive(Error, Debug)]
pub enum TraceWireError {
    #[error("Invocation {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: RequestId, timeout_ms: u64 },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not connected")]
    NotConnected,

    #[error("State violation: {0}")]
    StateViolation(String),

    #[error("Unknown operation code: {0}")]
    UnknownOperation(i32),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TraceWireError {
    /// Returns true for the typed correlation timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TraceWireError::Timeout { .. })
    }

    /// Returns true when the error means the connection went away.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            TraceWireError::ConnectionLost(_) | TraceWireError::NotConnected
        )
    }

    /// Returns true for caller contract violations.
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            TraceWireError::StateViolation(_) | TraceWireError::UnknownOperation(_)
        )
    }
}

impl From<std::net::AddrParseError> for TraceWireError {
    fn from(err: std::net::AddrParseError) -> Self {
        TraceWireError::Connection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TraceWireError>;
