use serde::{Deserialize, Serialize};

use super::invocation::{ProtocolInvocation, RequestId};
use super::response::ProtocolResponse;

/// A single frame's worth of traffic on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolMessage {
    Invocation(ProtocolInvocation),
    Response(ProtocolResponse),
}

impl ProtocolMessage {
    pub fn request_id(&self) -> RequestId {
        match self {
            ProtocolMessage::Invocation(inv) => inv.request_id(),
            ProtocolMessage::Response(resp) => resp.request_id(),
        }
    }
}

impl From<ProtocolInvocation> for ProtocolMessage {
    fn from(inv: ProtocolInvocation) -> Self {
        ProtocolMessage::Invocation(inv)
    }
}

impl From<ProtocolResponse> for ProtocolMessage {
    fn from(resp: ProtocolResponse) -> Self {
        ProtocolMessage::Response(resp)
    }
}
