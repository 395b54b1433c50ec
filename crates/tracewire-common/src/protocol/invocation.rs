use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use super::error::Result;
use super::op::OpCode;

pub type RequestId = i64;
pub type Payload = serde_json::Value;

/// Header naming the caller's timeout for a synchronous invocation, in milliseconds.
pub const TIMEOUT_HEADER: &str = "invocation.timeout";

static REQUEST_SERIAL: AtomicI64 = AtomicI64::new(0);

/// A request sent over the control channel.
///
/// The request id is assigned at construction from a process-wide counter and
/// never changes afterwards; it is what a [`ProtocolResponse`](super::ProtocolResponse)
/// echoes back for correlation. The op code is kept as a raw integer so that
/// receivers can reject codes they do not understand instead of failing to decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolInvocation {
    op_code: i32,
    request_id: RequestId,
    payload: Payload,
    /// Creation time in milliseconds since the UNIX epoch.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
}

impl ProtocolInvocation {
    pub fn new(op: OpCode, payload: Payload) -> Self {
        Self::with_code(op.code(), payload)
    }

    /// Builds an invocation from a raw op code, known or not.
    pub fn with_code(op_code: i32, payload: Payload) -> Self {
        ProtocolInvocation {
            op_code,
            request_id: next_request_id(),
            payload,
            created_at: epoch_millis(),
            headers: BTreeMap::new(),
        }
    }

    /// Records the caller's timeout as a header for the receiving side.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.headers
            .insert(TIMEOUT_HEADER.to_string(), timeout.as_millis().to_string());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn op_code(&self) -> i32 {
        self.op_code
    }

    /// Resolves the op code, failing on codes this build does not know.
    pub fn op(&self) -> Result<OpCode> {
        OpCode::try_from(self.op_code)
    }

    /// Unknown ops are treated as synchronous so a waiter is always resolved,
    /// either by the peer's error response or by the timeout.
    pub fn is_async(&self) -> bool {
        self.op().map(OpCode::is_async).unwrap_or(false)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// The timeout header parsed back into a duration, if present and valid.
    pub fn timeout(&self) -> Option<Duration> {
        self.header(TIMEOUT_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
    }
}

fn next_request_id() -> RequestId {
    REQUEST_SERIAL.fetch_add(1, Ordering::SeqCst) + 1
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
