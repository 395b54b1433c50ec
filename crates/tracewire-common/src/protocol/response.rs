//! Protocol response envelope.

use serde::{Deserialize, Serialize};

use super::error::{Result, TraceWireError};
use super::invocation::{Payload, ProtocolInvocation, RequestId};
use super::op::OpCode;

/// The receiving side's answer to a [`ProtocolInvocation`].
///
/// A response copies the request id of the invocation it answers and is
/// immutable once built. It correlates with at most one pending invocation;
/// if none is pending when it arrives (the waiter timed out, or the op was
/// fire-and-forget) it is dropped.
///
/// # Example
///
/// ```
/// use tracewire_common::protocol::{OpCode, ProtocolInvocation, ProtocolResponse};
/// use serde_json::json;
///
/// let ping = ProtocolInvocation::new(OpCode::Ping, json!("PING"));
/// let pong = ProtocolResponse::success(&ping, json!("PING"));
/// assert_eq!(pong.request_id(), ping.request_id());
/// assert!(pong.is_success());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolResponse {
    op_code: i32,
    request_id: RequestId,
    /// Result value (present on success)
    pub payload: Option<Payload>,
    /// Error message (present on failure)
    pub error: Option<String>,
}

impl ProtocolResponse {
    /// Creates a successful response answering `invocation`.
    pub fn success(invocation: &ProtocolInvocation, payload: Payload) -> Self {
        Self::success_for(invocation.op_code(), invocation.request_id(), payload)
    }

    /// Creates a successful response from raw correlation fields.
    pub fn success_for(op_code: i32, request_id: RequestId, payload: Payload) -> Self {
        ProtocolResponse {
            op_code,
            request_id,
            payload: Some(payload),
            error: None,
        }
    }

    /// Creates an error response answering `invocation`.
    pub fn error(invocation: &ProtocolInvocation, error: impl Into<String>) -> Self {
        Self::error_for(invocation.op_code(), invocation.request_id(), error)
    }

    pub fn error_for(op_code: i32, request_id: RequestId, error: impl Into<String>) -> Self {
        ProtocolResponse {
            op_code,
            request_id,
            payload: None,
            error: Some(error.into()),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn op_code(&self) -> i32 {
        self.op_code
    }

    pub fn op(&self) -> Result<OpCode> {
        OpCode::try_from(self.op_code)
    }

    /// True if the response is for an op code `op`, regardless of outcome.
    pub fn is_op(&self, op: OpCode) -> bool {
        self.op_code == op.code()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Converts the response into the value a waiter receives.
    ///
    /// Error responses become [`TraceWireError::Remote`]; a success without a
    /// payload resolves to `null`.
    pub fn into_result(self) -> Result<Payload> {
        match self.error {
            Some(message) => Err(TraceWireError::Remote(message)),
            None => Ok(self.payload.unwrap_or(Payload::Null)),
        }
    }
}
